//! Static bidirectional lookup tables between MISP `(category, type)`
//! pairs and the platform's artifact `dataType`. The enumerated mapping
//! in spec §6.5 is normative; this module is the single place it is
//! encoded.

/// MISP attribute type -> platform `dataType`, defaulting to `"other"`.
pub fn misp_type_to_data_type(misp_type: &str) -> &'static str {
    match misp_type {
        "md5" | "sha1" | "sha256" | "sha224" | "sha384" | "sha512" | "ssdeep" | "imphash"
        | "pehash" | "impfuzzy" => "hash",
        "ip-src" | "ip-dst" => "ip",
        "hostname" | "target-machine" => "fqdn",
        "domain" => "domain",
        "email-src" | "email-dst" | "whois-registrant-email" | "target-email" => "mail",
        "email-subject" => "mail_subject",
        "url" => "url",
        "uri" => "uri_path",
        "user-agent" => "user-agent",
        "filename" => "filename",
        "attachment" | "malware-sample" => "file",
        "regkey" | "regkey|value" => "registry",
        _ => "other",
    }
}

/// Length of a hash hex string -> the MISP type it routes to on export.
fn hash_type_for_len(len: usize) -> &'static str {
    match len {
        32 => "md5",
        40 => "sha1",
        56 => "sha224",
        64 => "sha256",
        71 => "sha384",
        128 => "sha512",
        _ => "other",
    }
}

/// Platform `(dataType, optional value)` -> MISP `(category, type)`.
pub fn data_type_to_misp(data_type: &str, value: Option<&str>) -> (&'static str, &'static str) {
    match data_type {
        "hash" => {
            let len = value.map(str::len).unwrap_or(0);
            ("Payload delivery", hash_type_for_len(len))
        }
        "ip" => ("Network activity", "ip-dst"),
        "fqdn" => ("Network activity", "hostname"),
        "domain" => ("Network activity", "domain"),
        "mail" => ("Payload delivery", "email-src"),
        "mail_subject" => ("Payload delivery", "email-subject"),
        "url" => ("External analysis", "url"),
        "uri_path" => ("External analysis", "uri"),
        "user-agent" => ("Network activity", "user-agent"),
        "filename" => ("Payload delivery", "filename"),
        "file" => ("Payload delivery", "malware-sample"),
        "registry" => ("Persistence mechanism", "regkey"),
        _ => ("Other", "other"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_hashes_to_hash_data_type() {
        for t in ["md5", "sha1", "sha256", "sha224", "sha384", "sha512", "ssdeep", "imphash"] {
            assert_eq!(misp_type_to_data_type(t), "hash");
        }
    }

    #[test]
    fn unknown_types_default_to_other() {
        assert_eq!(misp_type_to_data_type("vulnerability"), "other");
    }

    #[test]
    fn maps_network_and_file_types() {
        assert_eq!(misp_type_to_data_type("ip-src"), "ip");
        assert_eq!(misp_type_to_data_type("hostname"), "fqdn");
        assert_eq!(misp_type_to_data_type("domain"), "domain");
        assert_eq!(misp_type_to_data_type("attachment"), "file");
        assert_eq!(misp_type_to_data_type("malware-sample"), "file");
    }

    #[test]
    fn routes_hash_export_by_length() {
        let md5 = "d".repeat(32);
        let sha1 = "d".repeat(40);
        let sha224 = "d".repeat(56);
        let sha256 = "d".repeat(64);
        let sha384 = "d".repeat(71);
        let sha512 = "d".repeat(128);
        assert_eq!(data_type_to_misp("hash", Some(&md5)).1, "md5");
        assert_eq!(data_type_to_misp("hash", Some(&sha1)).1, "sha1");
        assert_eq!(data_type_to_misp("hash", Some(&sha224)).1, "sha224");
        assert_eq!(data_type_to_misp("hash", Some(&sha256)).1, "sha256");
        assert_eq!(data_type_to_misp("hash", Some(&sha384)).1, "sha384");
        assert_eq!(data_type_to_misp("hash", Some(&sha512)).1, "sha512");
        assert_eq!(data_type_to_misp("hash", Some("short")).1, "other");
    }
}

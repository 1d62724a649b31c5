//! Converts a single MISP attribute into zero or more platform artifact
//! descriptors (spec §4.2), including expansion of composite
//! `type1|type2` attributes into one descriptor per fragment.

use crate::model::{Artifact, ArtifactValue, InstanceConfig, MispAttribute};
use crate::taxonomy::misp_type_to_data_type;

const DEFAULT_TLP: u8 = 2;

/// Consumes any `tlp:white|green|amber|red` tag (case-insensitive),
/// returning the remaining tags and the resolved TLP. Absent a tag,
/// `DEFAULT_TLP` is used.
fn extract_tlp(tags: Vec<String>) -> (Vec<String>, u8) {
    let mut tlp = DEFAULT_TLP;
    let mut kept = Vec::with_capacity(tags.len());
    for tag in tags {
        let lower = tag.to_ascii_lowercase();
        let resolved = match lower.as_str() {
            "tlp:white" => Some(0),
            "tlp:green" => Some(1),
            "tlp:amber" => Some(2),
            "tlp:red" => Some(3),
            _ => None,
        };
        match resolved {
            Some(level) => tlp = level,
            None => kept.push(tag),
        }
    }
    (kept, tlp)
}

fn merged_tags(instance: &InstanceConfig, attribute: &MispAttribute) -> Vec<String> {
    let mut tags = Vec::with_capacity(4 + instance.artifact_tags.len() + attribute.tags.len());
    tags.push(format!("src:{}", instance.name));
    tags.push(format!("MISP:type={}", attribute.attr_type));
    tags.push(format!("MISP:category={}", attribute.category));
    tags.extend(instance.artifact_tags.iter().cloned());
    tags.extend(attribute.tags.iter().cloned());
    tags
}

fn finish(data_type: &str, value: ArtifactValue, tags: Vec<String>, message: Option<String>) -> Artifact {
    let (tags, tlp) = extract_tlp(tags);
    Artifact {
        data_type: data_type.to_string(),
        value,
        tags,
        tlp,
        message,
        start_date: None,
    }
}

/// `since` is the alert's last-sync watermark; absent disables delta
/// filtering (full sync).
pub fn transform(
    attribute: &MispAttribute,
    instance: &InstanceConfig,
    since: Option<i64>,
) -> Vec<Artifact> {
    if let Some(since) = since {
        if attribute.date <= since {
            tracing::debug!(attribute_id = %attribute.id, "dropping attribute older than watermark");
            return Vec::new();
        }
    }

    let tags = merged_tags(instance, attribute);

    if attribute.attr_type == "attachment" || attribute.attr_type == "malware-sample" {
        tracing::debug!(attribute_id = %attribute.id, "emitting remote attachment descriptor");
        return vec![finish(
            "file",
            ArtifactValue::RemoteAttachment {
                filename: attribute.value.clone(),
                reference: attribute.id.clone(),
                attr_type: attribute.attr_type.clone(),
            },
            tags,
            None,
        )];
    }

    if attribute.attr_type.contains('|') {
        let types: Vec<&str> = attribute.attr_type.split('|').collect();
        let values: Vec<&str> = attribute.value.split('|').collect();
        let len = types.len().max(values.len());
        let pairs: Vec<(String, String)> = (0..len)
            .map(|i| {
                let t = types.get(i).copied().unwrap_or("noType").to_string();
                let v = values.get(i).copied().unwrap_or("noValue").to_string();
                (t, v)
            })
            .collect();

        let summary = pairs
            .iter()
            .map(|(t, v)| format!("{}: {}", t, v))
            .collect::<Vec<_>>()
            .join("\n");

        tracing::debug!(attribute_id = %attribute.id, parts = pairs.len(), "expanding composite attribute");

        return pairs
            .into_iter()
            .map(|(t, v)| {
                let data_type = misp_type_to_data_type(&t);
                finish(data_type, ArtifactValue::Data(v), tags.clone(), Some(summary.clone()))
            })
            .collect();
    }

    let data_type = misp_type_to_data_type(&attribute.attr_type);
    vec![finish(data_type, ArtifactValue::Data(attribute.value.clone()), tags, None)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceConfig {
        InstanceConfig {
            name: "demo".to_string(),
            base_url: "https://misp.example".to_string(),
            api_key: "secret".to_string(),
            case_template: None,
            artifact_tags: vec![],
        }
    }

    fn attribute(attr_type: &str, value: &str, date: i64) -> MispAttribute {
        MispAttribute {
            id: "1".to_string(),
            attr_type: attr_type.to_string(),
            category: "Network activity".to_string(),
            value: value.to_string(),
            comment: String::new(),
            date,
            tags: vec![],
            deleted: false,
        }
    }

    #[test]
    fn drops_attributes_older_than_watermark() {
        let attrs = transform(&attribute("ip-dst", "1.2.3.4", 100), &instance(), Some(200));
        assert!(attrs.is_empty());
    }

    #[test]
    fn simple_attribute_becomes_one_descriptor_with_src_tag() {
        let artifacts = transform(&attribute("ip-dst", "1.2.3.4", 1704067200), &instance(), None);
        assert_eq!(artifacts.len(), 1);
        let a = &artifacts[0];
        assert_eq!(a.data_type, "ip");
        assert!(a.tags.contains(&"src:demo".to_string()));
        assert_eq!(a.tlp, DEFAULT_TLP);
        match &a.value {
            ArtifactValue::Data(v) => assert_eq!(v, "1.2.3.4"),
            _ => panic!("expected inline data"),
        }
    }

    #[test]
    fn malware_sample_becomes_remote_attachment() {
        let mut attr = attribute("malware-sample", "orig.exe", 1704067200);
        attr.id = "9".to_string();
        let artifacts = transform(&attr, &instance(), None);
        assert_eq!(artifacts.len(), 1);
        match &artifacts[0].value {
            ArtifactValue::RemoteAttachment { filename, reference, attr_type } => {
                assert_eq!(filename, "orig.exe");
                assert_eq!(reference, "9");
                assert_eq!(attr_type, "malware-sample");
            }
            _ => panic!("expected remote attachment"),
        }
    }

    #[test]
    fn composite_attribute_expands_to_two_descriptors_sharing_message() {
        let attr = attribute(
            "filename|md5",
            "a.exe|d41d8cd98f00b204e9800998ecf8427e",
            1704067200,
        );
        let artifacts = transform(&attr, &instance(), None);
        assert_eq!(artifacts.len(), 2);
        let types: Vec<&str> = artifacts.iter().map(|a| a.data_type.as_str()).collect();
        assert!(types.contains(&"filename"));
        assert!(types.contains(&"hash"));
        for a in &artifacts {
            let msg = a.message.as_ref().unwrap();
            assert!(msg.contains("filename: a.exe"));
            assert!(msg.contains("md5: d41d8cd98f00b204e9800998ecf8427e"));
        }
    }

    #[test]
    fn tlp_tag_is_extracted_and_removed() {
        let mut attr = attribute("ip-dst", "1.2.3.4", 1704067200);
        attr.tags = vec!["TLP:RED".to_string(), "other-tag".to_string()];
        let artifacts = transform(&attr, &instance(), None);
        assert_eq!(artifacts[0].tlp, 3);
        assert!(!artifacts[0].tags.iter().any(|t| t.to_lowercase().starts_with("tlp:")));
        assert!(artifacts[0].tags.contains(&"other-tag".to_string()));
    }

    #[test]
    fn first_ingest_tags_match_literal_scenario() {
        let artifacts = transform(&attribute("ip-dst", "1.2.3.4", 1704067200), &instance(), None);
        assert_eq!(
            artifacts[0].tags,
            vec!["src:demo", "MISP:type=ip-dst", "MISP:category=Network activity"]
        );
    }

    #[test]
    fn artifact_tag_closure_includes_instance_tags() {
        let mut inst = instance();
        inst.artifact_tags = vec!["inherited".to_string()];
        let artifacts = transform(&attribute("ip-dst", "1.2.3.4", 1704067200), &inst, None);
        assert!(artifacts[0].tags.contains(&"src:demo".to_string()));
        assert!(artifacts[0].tags.contains(&"inherited".to_string()));
    }
}

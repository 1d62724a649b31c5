//! Downloads remote MISP attachments and, for `malware-sample` payloads,
//! transparently extracts the password-protected archive MISP wraps them
//! in (spec §4.3).

use crate::client::MispClient;
use crate::error::{SyncError, SyncResult};
use crate::model::AttachmentFile;
use crate::store::TempStore;
use regex::Regex;
use std::io::{Read, Write};
use std::sync::OnceLock;
use tracing::warn;

const MALWARE_SAMPLE_PASSWORD: &[u8] = b"infected";

fn content_disposition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"attachment;\s*filename="(.*)""#).unwrap())
}

pub struct AttachmentHandler<'a> {
    client: &'a MispClient,
    temp: &'a dyn TempStore,
}

impl<'a> AttachmentHandler<'a> {
    pub fn new(client: &'a MispClient, temp: &'a dyn TempStore) -> Self {
        Self { client, temp }
    }

    /// GET `attributes/download/{id}`, streaming the body to a fresh temp
    /// file. Filename defaults to `"noname"`, MIME to
    /// `"application/octet-stream"` when the headers are absent.
    pub async fn download(&self, attachment_id: &str) -> SyncResult<AttachmentFile> {
        let response = self.client.download_attribute(attachment_id).await?;

        let filename = response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| content_disposition_regex().captures(v))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "noname".to_string());

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let path = self.temp.new_temporary_file("misp-download", &filename)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::Fetch { endpoint: attachment_id.to_string(), message: e.to_string(), body: None })?;

        let mut file = std::fs::File::create(&path)
            .map_err(|e| SyncError::Archive(format!("cannot create temp file: {e}")))?;
        file.write_all(&bytes)
            .map_err(|e| SyncError::Archive(format!("cannot write temp file: {e}")))?;

        Ok(AttachmentFile {
            name: filename,
            path,
            content_type,
        })
    }

    /// Opens `file` as a ZIP archive, applying the password `"infected"`
    /// if it is encrypted. On any ZIP error this degrades to returning
    /// the original file unchanged (best-effort, per spec §4.3).
    pub fn extract_malware_sample(&self, file: AttachmentFile) -> AttachmentFile {
        match self.try_extract(&file) {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!(error = %e, path = ?file.path, "malware sample extraction failed, returning original file");
                file
            }
        }
    }

    fn try_extract(&self, file: &AttachmentFile) -> SyncResult<AttachmentFile> {
        let reader = std::fs::File::open(&file.path)
            .map_err(|e| SyncError::Archive(format!("cannot open archive: {e}")))?;
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|e| SyncError::Archive(format!("not a zip archive: {e}")))?;

        let mut metadata_index = None;
        let mut content_index = None;
        for i in 0..archive.len() {
            let entry = archive
                .by_index_decrypt(i, MALWARE_SAMPLE_PASSWORD)
                .map_err(|e| SyncError::Archive(format!("cannot read zip entry {i}: {e}")))?
                .map_err(|_| SyncError::Archive("invalid archive password".to_string()))?;
            let name = entry.name().to_string();
            if name.ends_with(".filename.txt") {
                metadata_index.get_or_insert(i);
            } else if content_index.is_none() {
                content_index = Some(i);
            }
        }

        let metadata_index = metadata_index
            .ok_or_else(|| SyncError::Archive("no *.filename.txt metadata entry".to_string()))?;
        let content_index = content_index
            .ok_or_else(|| SyncError::Archive("no content entry".to_string()))?;

        let true_filename = {
            let mut entry = archive
                .by_index_decrypt(metadata_index, MALWARE_SAMPLE_PASSWORD)
                .map_err(|e| SyncError::Archive(e.to_string()))?
                .map_err(|_| SyncError::Archive("invalid archive password".to_string()))?;
            let mut buf = Vec::new();
            entry
                .by_ref()
                .take(128)
                .read_to_end(&mut buf)
                .map_err(|e| SyncError::Archive(format!("cannot read metadata entry: {e}")))?;
            String::from_utf8(buf).map_err(|e| SyncError::Archive(format!("metadata entry is not utf-8: {e}")))?
        };

        let extracted_path = self.temp.new_temporary_file("misp-sample", &true_filename)?;
        {
            let mut entry = archive
                .by_index_decrypt(content_index, MALWARE_SAMPLE_PASSWORD)
                .map_err(|e| SyncError::Archive(e.to_string()))?
                .map_err(|_| SyncError::Archive("invalid archive password".to_string()))?;
            let mut out = std::fs::File::create(&extracted_path)
                .map_err(|e| SyncError::Archive(format!("cannot create extracted file: {e}")))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| SyncError::Archive(format!("cannot extract content entry: {e}")))?;
        }

        Ok(AttachmentFile {
            name: true_filename,
            path: extracted_path,
            content_type: "application/octet-stream".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilesystemTempStore;
    use zip::unstable::write::FileOptionsExt;

    fn build_encrypted_sample(dir: &std::path::Path) -> std::path::PathBuf {
        let zip_path = dir.join("sample.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .with_deprecated_encryption(b"infected");

        writer.start_file("sample.filename.txt", options).unwrap();
        writer.write_all(b"evil.exe").unwrap();

        writer.start_file("sample", options).unwrap();
        writer.write_all(b"MZ-fake-binary-content").unwrap();

        writer.finish().unwrap();
        zip_path
    }

    #[tokio::test]
    async fn extracts_true_filename_and_content_from_encrypted_archive() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = build_encrypted_sample(dir.path());
        let temp = FilesystemTempStore::new(dir.path().join("work")).unwrap();

        let client = MispClient::new(
            reqwest::Client::new(),
            crate::model::InstanceConfig {
                name: "demo".to_string(),
                base_url: "https://example.invalid".to_string(),
                api_key: "k".to_string(),
                case_template: None,
                artifact_tags: vec![],
            },
        );
        let handler = AttachmentHandler::new(&client, &temp);

        let original = AttachmentFile {
            name: "orig.exe".to_string(),
            path: zip_path,
            content_type: "application/octet-stream".to_string(),
        };

        let extracted = handler.extract_malware_sample(original);
        assert_eq!(extracted.name, "evil.exe");
        let content = std::fs::read(&extracted.path).unwrap();
        assert_eq!(content, b"MZ-fake-binary-content");
    }

    #[tokio::test]
    async fn non_zip_file_degrades_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_zip = dir.path().join("plain.bin");
        std::fs::write(&not_a_zip, b"not a zip").unwrap();
        let temp = FilesystemTempStore::new(dir.path().join("work")).unwrap();

        let client = MispClient::new(
            reqwest::Client::new(),
            crate::model::InstanceConfig {
                name: "demo".to_string(),
                base_url: "https://example.invalid".to_string(),
                api_key: "k".to_string(),
                case_template: None,
                artifact_tags: vec![],
            },
        );
        let handler = AttachmentHandler::new(&client, &temp);

        let original = AttachmentFile {
            name: "orig.bin".to_string(),
            path: not_a_zip.clone(),
            content_type: "application/octet-stream".to_string(),
        };

        let result = handler.extract_malware_sample(original);
        assert_eq!(result.path, not_a_zip);
        assert_eq!(result.name, "orig.bin");
    }
}

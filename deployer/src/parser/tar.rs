//! Sequential tar(+gzip) artifact parser. The container's first entry is
//! always `header-info.json`; subsequent entries are
//! `<module-index>/files/<filename>` payloads whose size and checksum are
//! recomputed as they stream through (spec §6: "size ignored for trust").
//! `tar::Archive::entries()` never seeks, which is exactly what lets this
//! sit behind the ingestion pipeline's single-pass tee (SPEC_FULL.md §H).

use std::io::Read;

use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use fleet_common::{ArtifactMeta, UpdateFile, UpdateModule};

use super::{ArtifactParser, ParseError};

const HEADER_ENTRY: &str = "header-info.json";

#[derive(Deserialize)]
struct HeaderInfo {
    name: String,
    description: Option<String>,
    format: String,
    format_version: u32,
    device_types_compatible: Vec<String>,
    #[serde(default)]
    depends: fleet_common::DependsMap,
    #[serde(default)]
    provides: fleet_common::ProvidesMap,
    #[serde(default)]
    clears_provides: Vec<String>,
    updates: Vec<HeaderUpdateModule>,
    #[serde(default)]
    signed: bool,
}

#[derive(Deserialize)]
struct HeaderUpdateModule {
    #[serde(rename = "type")]
    kind: String,
    files: Vec<HeaderUpdateFile>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Deserialize)]
struct HeaderUpdateFile {
    name: String,
}

pub struct TarArtifactParser;

impl TarArtifactParser {
    pub fn new() -> Self {
        Self
    }

    fn module_file_key(module_index: usize, filename: &str) -> String {
        format!("{module_index}/files/{filename}")
    }
}

impl Default for TarArtifactParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactParser for TarArtifactParser {
    fn read(&self, reader: &mut dyn Read) -> Result<ArtifactMeta, ParseError> {
        let mut archive = ::tar::Archive::new(GzDecoder::new(reader));
        let mut header: Option<HeaderInfo> = None;
        let mut measured: std::collections::HashMap<String, (u64, String)> =
            std::collections::HashMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();

            if header.is_none() {
                if path != HEADER_ENTRY {
                    return Err(ParseError::MissingEntry(HEADER_ENTRY.to_string()));
                }
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                header = Some(serde_json::from_slice(&buf)?);
                continue;
            }

            let mut hasher = Sha256::new();
            let mut size = 0u64;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = entry.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                size += n as u64;
            }
            let checksum = format!("{:x}", hasher.finalize());
            measured.insert(path, (size, checksum));
        }

        let header = header.ok_or_else(|| ParseError::MissingEntry(HEADER_ENTRY.to_string()))?;
        if header.format_version == 0 {
            return Err(ParseError::UnsupportedVersion(header.format_version));
        }

        let now = Utc::now();
        let updates = header
            .updates
            .into_iter()
            .enumerate()
            .map(|(module_index, module)| UpdateModule {
                kind: module.kind,
                metadata: module.metadata,
                files: module
                    .files
                    .into_iter()
                    .map(|f| {
                        let key = Self::module_file_key(module_index, &f.name);
                        let (size, checksum) = measured.get(&key).cloned().unwrap_or_default();
                        UpdateFile {
                            name: f.name,
                            size,
                            checksum,
                            date: now,
                        }
                    })
                    .collect(),
            })
            .collect();

        Ok(ArtifactMeta {
            name: header.name,
            description: header.description,
            format: header.format,
            format_version: header.format_version,
            device_types_compatible: header.device_types_compatible,
            depends: header.depends,
            provides: header.provides,
            clears_provides: header.clears_provides,
            updates,
            signed: header.signed,
        })
    }

    fn read_headers_only(&self, reader: &mut dyn Read) -> Result<ArtifactMeta, ParseError> {
        let mut archive = ::tar::Archive::new(GzDecoder::new(reader));
        let mut entries = archive.entries()?;
        let mut first = entries
            .next()
            .ok_or_else(|| ParseError::MissingEntry(HEADER_ENTRY.to_string()))??;

        let path = first.path()?.to_string_lossy().into_owned();
        if path != HEADER_ENTRY {
            return Err(ParseError::MissingEntry(HEADER_ENTRY.to_string()));
        }
        let mut buf = Vec::new();
        first.read_to_end(&mut buf)?;
        let header: HeaderInfo = serde_json::from_slice(&buf)?;

        let now = Utc::now();
        let updates = header
            .updates
            .into_iter()
            .map(|module| UpdateModule {
                kind: module.kind,
                metadata: module.metadata,
                files: module
                    .files
                    .into_iter()
                    .map(|f| UpdateFile {
                        name: f.name,
                        size: 0,
                        checksum: String::new(),
                        date: now,
                    })
                    .collect(),
            })
            .collect();

        Ok(ArtifactMeta {
            name: header.name,
            description: header.description,
            format: header.format,
            format_version: header.format_version,
            device_types_compatible: header.device_types_compatible,
            depends: header.depends,
            provides: header.provides,
            clears_provides: header.clears_provides,
            updates,
            signed: header.signed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn build_artifact(header_json: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = ::tar::Builder::new(Vec::new());

        let mut append = |name: &str, data: &[u8]| {
            let mut header = ::tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };

        append(HEADER_ENTRY, header_json.as_bytes());
        for (name, data) in files {
            append(name, data);
        }

        let tar_bytes = builder.into_inner().unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    #[test]
    fn parses_header_and_recomputes_checksum() {
        let header = r#"{
            "name": "App1 v1.0",
            "format": "mender",
            "format_version": 3,
            "device_types_compatible": ["bar", "baz"],
            "updates": [{"type": "rootfs-image", "files": [{"name": "app.bin"}]}]
        }"#;
        let payload = b"hello world";
        let container = build_artifact(header, &[("0/files/app.bin", payload)]);

        let parser = TarArtifactParser::new();
        let mut cursor = std::io::Cursor::new(container);
        let meta = parser.read(&mut cursor).unwrap();

        assert_eq!(meta.name, "App1 v1.0");
        assert_eq!(meta.device_types_compatible, vec!["bar", "baz"]);
        let file = &meta.updates[0].files[0];
        assert_eq!(file.size, payload.len() as u64);
        assert_eq!(file.checksum, format!("{:x}", Sha256::digest(payload)));
    }

    #[test]
    fn missing_header_entry_is_rejected() {
        let mut builder = ::tar::Builder::new(Vec::new());
        let mut header = ::tar::Header::new_gnu();
        header.set_size(2);
        header.set_cksum();
        builder.append_data(&mut header, "not-header.json", b"{}" as &[u8]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        let bad_container = gz.finish().unwrap();

        let parser = TarArtifactParser::new();
        let mut cursor = std::io::Cursor::new(bad_container);
        let err = parser.read(&mut cursor).unwrap_err();
        assert!(matches!(err, ParseError::MissingEntry(_)));
    }

    #[test]
    fn headers_only_stops_after_first_entry() {
        let header = r#"{
            "name": "App1 v1.0",
            "format": "mender",
            "format_version": 3,
            "device_types_compatible": ["bar"],
            "updates": []
        }"#;
        let container = build_artifact(header, &[("0/files/app.bin", b"ignored")]);

        let parser = TarArtifactParser::new();
        let mut cursor = std::io::Cursor::new(container);
        let meta = parser.read_headers_only(&mut cursor).unwrap();
        assert_eq!(meta.name, "App1 v1.0");
    }
}


//! Digest registry: content fingerprint → content type, metadata and the
//! file nodes that share the content.
//!
//! The registry can be backed by an append-only snapshot. Every change
//! appends one line `<hex fingerprint>\t<json>` holding the entry's full
//! state, so when the snapshot is loaded a later line for a fingerprint
//! overrides the earlier ones. `shutdown` rewrites the snapshot with one
//! line per entry.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::magic::ContentType;
use crate::model::Fingerprint;

const HEADER_BYTES: usize = 64 * 1024;

/// Produces descriptive metadata for newly registered content.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path, content_type: ContentType) -> Option<Value>;
}

/// Reads pixel dimensions from PNG, GIF and JPEG headers and reports the
/// byte size of everything.
pub struct HeaderExtractor;

impl MetadataExtractor for HeaderExtractor {
    fn extract(&self, path: &Path, content_type: ContentType) -> Option<Value> {
        let bytes = fs::metadata(path).ok()?.len();
        let mut head = Vec::with_capacity(HEADER_BYTES);
        if let Err(e) = File::open(path).and_then(|f| f.take(HEADER_BYTES as u64).read_to_end(&mut head)) {
            warn!("cannot read header of {}: {}", path.display(), e);
            return Some(json!({ "bytes": bytes }));
        }
        let dimensions = match content_type {
            ContentType::Png => png_dimensions(&head),
            ContentType::Gif => gif_dimensions(&head),
            ContentType::Jpeg => jpeg_dimensions(&head),
            _ => None,
        };
        Some(match dimensions {
            Some((width, height)) => json!({ "bytes": bytes, "width": width, "height": height }),
            None => json!({ "bytes": bytes }),
        })
    }
}

fn be16(b: &[u8]) -> u32 {
    u32::from(b[0]) << 8 | u32::from(b[1])
}

fn png_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    // signature (8) + IHDR length and tag (8) + width (4) + height (4)
    if head.len() < 24 || &head[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(head[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(head[20..24].try_into().ok()?);
    Some((width, height))
}

fn gif_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    if head.len() < 10 {
        return None;
    }
    let width = u32::from(u16::from_le_bytes([head[6], head[7]]));
    let height = u32::from(u16::from_le_bytes([head[8], head[9]]));
    Some((width, height))
}

fn jpeg_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 9 < head.len() {
        if head[i] != 0xFF {
            return None;
        }
        let marker = head[i + 1];
        // start-of-frame markers, excluding DHT, JPG and DAC
        if (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let height = be16(&head[i + 5..]);
            let width = be16(&head[i + 7..]);
            return Some((width, height));
        }
        i += 2 + be16(&head[i + 2..]) as usize;
    }
    None
}

/// One registered piece of content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub fingerprint: Fingerprint,
    pub content_type: ContentType,
    pub metadata: Option<Value>,
    /// File nodes holding this content
    pub nodes: BTreeSet<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct Record {
    content_type: ContentType,
    #[serde(default)]
    metadata: Option<Value>,
    nodes: BTreeSet<Uuid>,
}

fn encode(entry: &RegistryEntry) -> EngineResult<String> {
    let record = Record {
        content_type: entry.content_type,
        metadata: entry.metadata.clone(),
        nodes: entry.nodes.clone(),
    };
    let json = serde_json::to_string(&record).map_err(|e| EngineError::Io {
        path: PathBuf::new(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;
    Ok(format!("{}\t{}\n", entry.fingerprint, json))
}

fn decode(line: &str) -> Option<RegistryEntry> {
    let (hex, json) = line.split_once('\t')?;
    let fingerprint: Fingerprint = hex.parse().ok()?;
    let record: Record = serde_json::from_str(json).ok()?;
    Some(RegistryEntry {
        fingerprint,
        content_type: record.content_type,
        metadata: record.metadata,
        nodes: record.nodes,
    })
}

pub struct DigestRegistry {
    entries: HashMap<Fingerprint, RegistryEntry>,
    snapshot: Option<PathBuf>,
    log: Option<File>,
    extractor: Box<dyn MetadataExtractor>,
}

impl DigestRegistry {
    /// Registry with no snapshot.
    pub fn in_memory(extractor: Box<dyn MetadataExtractor>) -> Self {
        DigestRegistry {
            entries: HashMap::new(),
            snapshot: None,
            log: None,
            extractor,
        }
    }

    /// Load the snapshot at `snapshot` (if any) and keep appending to it.
    pub fn open(snapshot: Option<PathBuf>, extractor: Box<dyn MetadataExtractor>) -> EngineResult<Self> {
        let mut registry = Self::in_memory(extractor);
        let Some(path) = snapshot else {
            return Ok(registry);
        };

        match File::open(&path) {
            Ok(file) => {
                let mut skipped = 0usize;
                for (number, line) in BufReader::new(file).lines().enumerate() {
                    let line = line.map_err(|e| EngineError::io(&path, e))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode(&line) {
                        Some(entry) => {
                            registry.entries.insert(entry.fingerprint, entry);
                        }
                        None => {
                            warn!("skipping malformed registry line {} in {}", number + 1, path.display());
                            skipped += 1;
                        }
                    }
                }
                info!(
                    "loaded {} registry entries from {} ({} lines skipped)",
                    registry.entries.len(),
                    path.display(),
                    skipped
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("registry snapshot {} does not exist yet", path.display());
            }
            Err(e) => return Err(EngineError::io(&path, e)),
        }

        registry.log = Some(Self::append_handle(&path)?);
        registry.snapshot = Some(path);
        Ok(registry)
    }

    fn append_handle(path: &Path) -> EngineResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::io(path, e))
    }

    fn append(&mut self, entry: &RegistryEntry) -> EngineResult<()> {
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };
        let line = encode(entry)?;
        let path = self.snapshot.as_deref().unwrap_or_else(|| Path::new(""));
        log.write_all(line.as_bytes()).map_err(|e| EngineError::io(path, e))
    }

    /// Register `node` as holding the content `fingerprint`.
    ///
    /// The first registration creates the entry and extracts metadata from
    /// `path` when the content type warrants it. Returns true when the entry
    /// was created. Memory is only updated once the snapshot line is written.
    pub fn index(
        &mut self,
        fingerprint: Fingerprint,
        content_type: ContentType,
        node: Uuid,
        path: &Path,
    ) -> EngineResult<bool> {
        let (entry, created) = match self.entries.get(&fingerprint) {
            Some(entry) if entry.nodes.contains(&node) => return Ok(false),
            Some(entry) => {
                let mut entry = entry.clone();
                entry.nodes.insert(node);
                (entry, false)
            }
            None => {
                let metadata = if content_type.warrants_metadata() {
                    self.extractor.extract(path, content_type)
                } else {
                    None
                };
                let entry = RegistryEntry {
                    fingerprint,
                    content_type,
                    metadata,
                    nodes: BTreeSet::from([node]),
                };
                (entry, true)
            }
        };
        self.append(&entry)?;
        if created {
            debug!("new content {} ({:?})", fingerprint, content_type);
        }
        self.entries.insert(fingerprint, entry);
        Ok(created)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&RegistryEntry> {
        self.entries.get(fingerprint)
    }

    pub fn nodes_of(&self, fingerprint: &Fingerprint) -> Vec<Uuid> {
        self.entries
            .get(fingerprint)
            .map(|e| e.nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains_node(&self, fingerprint: &Fingerprint, node: Uuid) -> bool {
        self.entries.get(fingerprint).map_or(false, |e| e.nodes.contains(&node))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the snapshot with one line per entry.
    pub fn shutdown(&mut self) -> EngineResult<()> {
        let Some(path) = self.snapshot.clone() else {
            return Ok(());
        };
        self.log.take();

        let mut fingerprints: Vec<&Fingerprint> = self.entries.keys().collect();
        fingerprints.sort();
        let mut text = String::new();
        for fingerprint in fingerprints {
            text.push_str(&encode(&self.entries[fingerprint])?);
        }

        let tmp = path.with_extension("compact");
        let mut file = File::create(&tmp).map_err(|e| EngineError::io(&tmp, e))?;
        file.write_all(text.as_bytes()).map_err(|e| EngineError::io(&tmp, e))?;
        file.sync_all().map_err(|e| EngineError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| EngineError::io(&path, e))?;
        info!("compacted registry snapshot {} to {} entries", path.display(), self.entries.len());

        self.log = Some(Self::append_handle(&path)?);
        Ok(())
    }
}

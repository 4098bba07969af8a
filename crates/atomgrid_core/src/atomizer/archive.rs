//! POSIX ustar archive atomizer.
//!
//! # Invariants
//! - Entry `i` contributes a name atom (`Reference`, sequence `i`) and, when
//!   within the depth limit, the root of its own atomization (`ParentChild`,
//!   sequence `i`).
//! - Entries past the depth limit produce no content atoms, only a
//!   `RecursionLimitExceeded` warning.
//! - A corrupt header ends the walk; earlier entries are kept.

use crate::atomizer::detect::TAR;
use crate::atomizer::{
    AtomizationOutput, AtomizeContext, AtomizeError, Atomizer, ChildOutcome, SourceMetadata,
};
use crate::model::atom::Modality;
use crate::model::relation::{AtomRelation, RelationType};
use crate::model::warning::WarningCode;

const NAME: &str = "archive";
const BLOCK: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveAtomizer;

#[derive(Debug, PartialEq, Eq)]
struct TarEntry<'a> {
    name: String,
    kind: u8,
    data: &'a [u8],
}

fn parse_octal(field: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(field).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if trimmed.is_empty() {
        return Some(0);
    }
    usize::from_str_radix(trimmed, 8).ok()
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn checksum(header: &[u8]) -> usize {
    header
        .iter()
        .enumerate()
        .map(|(index, byte)| {
            if (148..156).contains(&index) {
                usize::from(b' ')
            } else {
                usize::from(*byte)
            }
        })
        .sum()
}

/// Walks archive entries; returns the entries read and an error describing
/// why the walk stopped early, if it did.
fn read_entries(content: &[u8]) -> (Vec<TarEntry<'_>>, Option<String>) {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + BLOCK <= content.len() {
        let header = &content[offset..offset + BLOCK];
        if header.iter().all(|byte| *byte == 0) {
            return (entries, None);
        }
        if &header[257..262] != b"ustar" {
            return (entries, Some(format!("missing ustar magic at offset {offset}")));
        }
        match parse_octal(&header[148..156]) {
            Some(stored) if stored == checksum(header) => {}
            _ => return (entries, Some(format!("header checksum mismatch at offset {offset}"))),
        }
        let Some(size) = parse_octal(&header[124..136]) else {
            return (entries, Some(format!("invalid entry size at offset {offset}")));
        };

        let data_start = offset + BLOCK;
        let Some(data_end) = data_start.checked_add(size).filter(|end| *end <= content.len()) else {
            return (entries, Some(format!("entry data truncated at offset {offset}")));
        };

        let prefix = field_str(&header[345..500]);
        let base = field_str(&header[0..100]);
        let name = if prefix.is_empty() {
            base
        } else {
            format!("{prefix}/{base}")
        };
        entries.push(TarEntry {
            name,
            kind: header[156],
            data: &content[data_start..data_end],
        });
        offset = data_start + size.div_ceil(BLOCK) * BLOCK;
    }
    if entries.is_empty() {
        (entries, Some("archive has no complete header".to_string()))
    } else {
        (entries, None)
    }
}

/// Writes a minimal ustar archive of regular files.
///
/// Names longer than 100 bytes are truncated.
pub fn write_ustar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in entries {
        let mut header = [0_u8; BLOCK];
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(100);
        header[..name_len].copy_from_slice(&name_bytes[..name_len]);
        header[100..108].copy_from_slice(b"0000644\0");
        header[108..116].copy_from_slice(b"0000000\0");
        header[116..124].copy_from_slice(b"0000000\0");
        header[124..136].copy_from_slice(format!("{:011o}\0", data.len()).as_bytes());
        header[136..148].copy_from_slice(b"00000000000\0");
        header[156] = b'0';
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        let sum = checksum(&header);
        header[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());

        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        out.resize(out.len().div_ceil(BLOCK) * BLOCK, 0);
    }
    out.resize(out.len() + 2 * BLOCK, 0);
    out
}

impl Atomizer for ArchiveAtomizer {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        90
    }

    fn can_handle(&self, content_type: &str, extension: Option<&str>) -> bool {
        content_type == TAR || extension == Some("tar")
    }

    fn atomize(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        _source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError> {
        let (entries, stopped) = read_entries(content);
        if entries.is_empty() {
            if let Some(reason) = stopped {
                return Err(AtomizeError::malformed(NAME, reason));
            }
        }

        let root = ctx.file_root(content, Modality::Archive);
        let root_hash = root.content_hash;
        let mut output = AtomizationOutput::new(root);
        if let Some(reason) = stopped {
            output.warn(ctx.warning(WarningCode::MalformedContent, reason));
        }

        for (index, entry) in entries.iter().enumerate() {
            let sequence = index as u64;
            if ctx.stop_if_cancelled(&mut output) {
                break;
            }
            output.attach(
                root_hash,
                ctx.draft(entry.name.as_bytes(), Modality::Text, "entry_name"),
                RelationType::Reference,
                sequence,
            );

            match entry.kind {
                b'0' | 0 => {}
                b'5' => continue,
                other => {
                    output.warn(ctx.warning(
                        WarningCode::UnsupportedEntry,
                        format!("entry `{}` has unsupported type `{}`", entry.name, other as char),
                    ));
                    continue;
                }
            }
            if entry.data.is_empty() {
                continue;
            }

            let source = SourceMetadata::named(entry.name.clone());
            match ctx.dispatch_child(entry.data, &source) {
                Ok(ChildOutcome::Atomized(child)) => {
                    let child_root = output.absorb(child);
                    output.add_relation(
                        AtomRelation::new(root_hash, child_root, RelationType::ParentChild)
                            .at(sequence),
                    );
                }
                Ok(ChildOutcome::DepthExceeded) => {
                    output.warn(
                        ctx.warning(
                            WarningCode::RecursionLimitExceeded,
                            format!(
                                "entry `{}` exceeds max depth {}",
                                entry.name,
                                ctx.limits().max_depth
                            ),
                        ),
                    );
                }
                Ok(ChildOutcome::Cancelled) => {
                    ctx.stop_if_cancelled(&mut output);
                    break;
                }
                Err(err) => {
                    output.warn(ctx.warning(
                        WarningCode::MalformedContent,
                        format!("entry `{}` skipped: {err}", entry.name),
                    ));
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::{read_entries, write_ustar};

    #[test]
    fn writer_output_reads_back() {
        let archive = write_ustar(&[
            ("a.txt", b"alpha".as_slice()),
            ("dir/b.bin", [1_u8, 2, 3].as_slice()),
        ]);
        assert_eq!(archive.len() % 512, 0);

        let (entries, stopped) = read_entries(&archive);
        assert!(stopped.is_none());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].data, b"alpha".as_slice());
        assert_eq!(entries[1].data, [1_u8, 2, 3].as_slice());
    }

    #[test]
    fn corrupt_checksum_stops_the_walk() {
        let mut archive = write_ustar(&[("a.txt", b"alpha".as_slice()), ("b.txt", b"beta".as_slice())]);
        archive[1024] ^= 0xff;
        let (entries, stopped) = read_entries(&archive);
        assert_eq!(entries.len(), 1);
        assert!(stopped.unwrap().contains("checksum"));
    }
}

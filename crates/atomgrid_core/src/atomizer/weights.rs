//! Safetensors model-weight atomizer.
//!
//! Layout: `u64` little-endian header length, JSON header, raw tensor data.
//! Each tensor yields a descriptor atom (name, dtype, shape) under the root
//! and element atoms under the descriptor in flat row-major order, capped at
//! `max_tensor_elements` per tensor.

use crate::atomizer::detect::SAFETENSORS;
use crate::atomizer::{AtomizationOutput, AtomizeContext, AtomizeError, Atomizer, SourceMetadata};
use crate::model::atom::Modality;
use crate::model::relation::{AtomRelation, RelationType, SpatialMetadata};
use crate::model::warning::WarningCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const NAME: &str = "safetensors";
const METADATA_KEY: &str = "__metadata__";

#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsAtomizer;

#[derive(Debug, Clone, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

#[derive(Debug, Serialize)]
struct TensorDescriptor<'a> {
    name: &'a str,
    dtype: &'a str,
    shape: &'a [u64],
}

fn element_size(dtype: &str) -> Option<usize> {
    match dtype {
        "BOOL" | "U8" | "I8" | "F8_E4M3" | "F8_E5M2" => Some(1),
        "U16" | "I16" | "F16" | "BF16" => Some(2),
        "U32" | "I32" | "F32" => Some(4),
        "U64" | "I64" | "F64" => Some(8),
        _ => None,
    }
}

fn parse_header(content: &[u8]) -> Result<(Vec<(String, TensorInfo)>, &[u8]), AtomizeError> {
    let len_bytes: [u8; 8] = content
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| AtomizeError::malformed(NAME, "missing header length"))?;
    let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| AtomizeError::malformed(NAME, "header length overflows"))?;
    let header_end = 8_usize
        .checked_add(header_len)
        .filter(|end| *end <= content.len())
        .ok_or_else(|| AtomizeError::malformed(NAME, "header extends past end of file"))?;

    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&content[8..header_end])
        .map_err(|err| AtomizeError::malformed(NAME, format!("invalid header json: {err}")))?;

    let mut tensors = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        if name == METADATA_KEY {
            continue;
        }
        let info: TensorInfo = serde_json::from_value(value).map_err(|err| {
            AtomizeError::malformed(NAME, format!("invalid tensor `{name}`: {err}"))
        })?;
        tensors.push((name, info));
    }
    tensors.sort_by(|a, b| a.1.data_offsets[0].cmp(&b.1.data_offsets[0]).then(a.0.cmp(&b.0)));
    Ok((tensors, &content[header_end..]))
}

impl Atomizer for SafetensorsAtomizer {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        85
    }

    fn can_handle(&self, content_type: &str, extension: Option<&str>) -> bool {
        content_type == SAFETENSORS || extension == Some("safetensors")
    }

    fn atomize(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        _source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError> {
        let (tensors, data) = parse_header(content)?;
        let root = ctx.file_root(content, Modality::ModelWeights);
        let root_hash = root.content_hash;
        let mut output = AtomizationOutput::new(root);
        let element_limit = ctx.limits().max_tensor_elements;

        for (index, (name, info)) in tensors.iter().enumerate() {
            if ctx.stop_if_cancelled(&mut output) {
                break;
            }
            let descriptor_bytes = serde_json::to_vec(&TensorDescriptor {
                name,
                dtype: &info.dtype,
                shape: &info.shape,
            })
            .map_err(|err| AtomizeError::malformed(NAME, err.to_string()))?;
            let descriptor = output.add_atom(ctx.draft(&descriptor_bytes, Modality::ModelWeights, "tensor"));
            output.add_relation(
                AtomRelation::new(root_hash, descriptor, RelationType::ParentChild)
                    .at(index as u64)
                    .with_spatial(SpatialMetadata::Tensor {
                        shape: info.shape.clone(),
                    }),
            );

            let Some(size) = element_size(&info.dtype) else {
                output.warn(ctx.warning(
                    WarningCode::UnsupportedEntry,
                    format!("tensor `{name}` has unsupported dtype {}", info.dtype),
                ));
                continue;
            };
            let count = info.shape.iter().try_fold(1_u64, |acc, dim| acc.checked_mul(*dim));
            let [start, end] = info.data_offsets;
            let bytes = match count.and_then(|count| count.checked_mul(size as u64)) {
                Some(expected) if end >= start && end - start == expected && end as usize <= data.len() => {
                    &data[start as usize..end as usize]
                }
                _ => {
                    output.warn(ctx.warning(
                        WarningCode::MalformedContent,
                        format!("tensor `{name}` offsets disagree with its shape"),
                    ));
                    continue;
                }
            };

            let subtype = format!("element_{}", info.dtype.to_ascii_lowercase());
            let total = bytes.len() / size;
            for (position, element) in bytes.chunks_exact(size).take(element_limit).enumerate() {
                let child = output.add_atom(ctx.draft(element, Modality::ModelWeights, &subtype));
                let mut relation =
                    AtomRelation::new(descriptor, child, RelationType::Sequence).at(position as u64);
                if info.dtype == "F32" {
                    let value = f32::from_le_bytes([element[0], element[1], element[2], element[3]]);
                    if value.is_finite() {
                        relation = relation.with_weight(value);
                    }
                }
                output.add_relation(relation);
            }
            if total > element_limit {
                output.warn(ctx.warning(
                    WarningCode::ElementLimitReached,
                    format!("tensor `{name}`: atomized {element_limit} of {total} elements"),
                ));
            }
        }
        Ok(output)
    }
}

/// Serializes F32 tensors into a safetensors payload.
pub fn write_safetensors(tensors: &[(&str, Vec<u64>, Vec<f32>)]) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, shape, values) in tensors {
        let start = data.len();
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        header.insert(
            (*name).to_string(),
            serde_json::json!({
                "dtype": "F32",
                "shape": shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }
    let header_bytes = serde_json::Value::Object(header).to_string().into_bytes();
    let mut out = (header_bytes.len() as u64).to_le_bytes().to_vec();
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&data);
    out
}

#[cfg(test)]
mod tests {
    use super::{write_safetensors, SafetensorsAtomizer};
    use crate::atomizer::{AtomizeLimits, AtomizerRegistry, BinaryAtomizer, SourceMetadata};
    use crate::cancel::CancellationToken;
    use crate::model::relation::RelationType;
    use crate::model::warning::WarningCode;
    use std::sync::Arc;

    fn registry() -> AtomizerRegistry {
        let mut registry = AtomizerRegistry::new();
        registry.register(Arc::new(SafetensorsAtomizer)).unwrap();
        registry.register(Arc::new(BinaryAtomizer)).unwrap();
        registry
    }

    #[test]
    fn tensors_become_descriptors_with_deduplicated_elements() {
        let payload = write_safetensors(&[
            ("bias", vec![2], vec![0.5, 0.5]),
            ("weight", vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]),
        ]);
        let output = registry()
            .atomize(&payload, &SourceMetadata::named("m.safetensors"), AtomizeLimits::default(), &CancellationToken::new())
            .unwrap();

        // root, 2 descriptors, elements {0.5, 1.0, 0.0}
        assert_eq!(output.atoms().len(), 6);
        let sequences = output
            .relations()
            .iter()
            .filter(|relation| relation.relation_type == RelationType::Sequence)
            .count();
        assert_eq!(sequences, 6);
        assert!(output.warnings().is_empty());
    }

    #[test]
    fn element_cap_truncates_with_warning() {
        let payload = write_safetensors(&[("t", vec![8], (0..8).map(|v| v as f32).collect())]);
        let limits = AtomizeLimits {
            max_tensor_elements: 3,
            ..AtomizeLimits::default()
        };
        let output = registry()
            .atomize(&payload, &SourceMetadata::named("m.safetensors"), limits, &CancellationToken::new())
            .unwrap();
        assert!(output.has_warning(WarningCode::ElementLimitReached));
        assert_eq!(output.atoms().len(), 1 + 1 + 3);
    }

    #[test]
    fn garbage_header_falls_back() {
        let mut payload = 4_u64.to_le_bytes().to_vec();
        payload.extend_from_slice(b"{no}");
        let output = registry()
            .atomize(&payload, &SourceMetadata::named("m.safetensors"), AtomizeLimits::default(), &CancellationToken::new())
            .unwrap();
        assert!(output.has_warning(WarningCode::MalformedContent));
    }
}

//! Binary netpbm (P5 grayscale, P6 RGB) image atomizer.
//!
//! The header becomes one atom at sequence 0; each pixel becomes an atom of
//! its channel bytes linked at `1 + y * width + x` with `Pixel` metadata.
//! Identical pixel values collapse into one atom.

use crate::atomizer::detect::{PGM, PPM};
use crate::atomizer::{AtomizationOutput, AtomizeContext, AtomizeError, Atomizer, SourceMetadata};
use crate::model::atom::Modality;
use crate::model::relation::{AtomRelation, RelationType, SpatialMetadata};
use crate::model::warning::WarningCode;

const NAME: &str = "netpbm";

#[derive(Debug, Clone, Copy, Default)]
pub struct NetpbmAtomizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NetpbmHeader {
    channels: usize,
    width: usize,
    height: usize,
    /// Offset of the first sample byte.
    data_offset: usize,
}

fn parse_header(content: &[u8]) -> Result<NetpbmHeader, AtomizeError> {
    let channels = match content.get(..2) {
        Some(b"P5") => 1,
        Some(b"P6") => 3,
        _ => return Err(AtomizeError::malformed(NAME, "missing P5/P6 magic")),
    };

    let mut cursor = 2;
    let mut fields = [0_usize; 3];
    for field in fields.iter_mut() {
        // whitespace and comment lines
        loop {
            match content.get(cursor) {
                Some(byte) if byte.is_ascii_whitespace() => cursor += 1,
                Some(b'#') => {
                    while content.get(cursor).is_some_and(|byte| *byte != b'\n') {
                        cursor += 1;
                    }
                }
                Some(_) => break,
                None => return Err(AtomizeError::malformed(NAME, "truncated header")),
            }
        }
        let start = cursor;
        while content.get(cursor).is_some_and(u8::is_ascii_digit) {
            cursor += 1;
        }
        let digits = std::str::from_utf8(&content[start..cursor]).unwrap_or_default();
        *field = digits
            .parse()
            .map_err(|_| AtomizeError::malformed(NAME, "header field is not a number"))?;
    }

    let [width, height, max_value] = fields;
    if width == 0 || height == 0 {
        return Err(AtomizeError::malformed(NAME, "zero image dimension"));
    }
    if max_value == 0 || max_value > 255 {
        return Err(AtomizeError::malformed(NAME, "only 8-bit samples are supported"));
    }
    if !content.get(cursor).is_some_and(u8::is_ascii_whitespace) {
        return Err(AtomizeError::malformed(NAME, "missing separator after header"));
    }

    let header = NetpbmHeader {
        channels,
        width,
        height,
        data_offset: cursor + 1,
    };
    let expected = width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(channels))
        .ok_or_else(|| AtomizeError::malformed(NAME, "image dimensions overflow"))?;
    if content.len() - header.data_offset < expected {
        return Err(AtomizeError::malformed(NAME, "pixel data is truncated"));
    }
    Ok(header)
}

impl Atomizer for NetpbmAtomizer {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        80
    }

    fn can_handle(&self, content_type: &str, extension: Option<&str>) -> bool {
        content_type == PGM
            || content_type == PPM
            || matches!(extension, Some("pgm" | "ppm" | "pnm"))
    }

    fn atomize(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        _source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError> {
        let header = parse_header(content)?;
        let root = ctx.file_root(content, Modality::Image).with_embeddable(true);
        let root_hash = root.content_hash;
        let mut output = AtomizationOutput::new(root);

        output.attach(
            root_hash,
            ctx.draft(&content[..header.data_offset], Modality::Image, "header"),
            RelationType::ParentChild,
            0,
        );

        let pixel_limit = ctx.limits().max_tensor_elements;
        let total = header.width * header.height;
        let samples = &content[header.data_offset..];

        'rows: for y in 0..header.height {
            if ctx.stop_if_cancelled(&mut output) {
                break;
            }
            for x in 0..header.width {
                let index = y * header.width + x;
                if index >= pixel_limit {
                    output.warn(ctx.warning(
                        WarningCode::ElementLimitReached,
                        format!("atomized {pixel_limit} of {total} pixels"),
                    ));
                    break 'rows;
                }
                let start = index * header.channels;
                let pixel = output.add_atom(ctx.draft(
                    &samples[start..start + header.channels],
                    Modality::Image,
                    "pixel",
                ));
                output.add_relation(
                    AtomRelation::new(root_hash, pixel, RelationType::ParentChild)
                        .at(index as u64 + 1)
                        .with_spatial(SpatialMetadata::Pixel {
                            x: x as u32,
                            y: y as u32,
                        }),
                );
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_header, NetpbmAtomizer};
    use crate::atomizer::{AtomizeLimits, AtomizerRegistry, BinaryAtomizer, SourceMetadata};
    use crate::cancel::CancellationToken;
    use crate::model::relation::SpatialMetadata;
    use crate::model::warning::WarningCode;
    use std::sync::Arc;

    fn registry() -> AtomizerRegistry {
        let mut registry = AtomizerRegistry::new();
        registry.register(Arc::new(NetpbmAtomizer)).unwrap();
        registry.register(Arc::new(BinaryAtomizer)).unwrap();
        registry
    }

    #[test]
    fn header_parser_skips_comments() {
        let header = parse_header(b"P6\n# made by hand\n2 1\n255\n\x01\x02\x03\x04\x05\x06").unwrap();
        assert_eq!((header.channels, header.width, header.height), (3, 2, 1));
        assert_eq!(header.data_offset, 26);
    }

    #[test]
    fn grayscale_pixels_share_atoms_and_keep_positions() {
        let image = b"P5 2 2 255\n\x00\x07\x07\x00";
        let output = registry()
            .atomize(image, &SourceMetadata::named("tiny.pgm"), AtomizeLimits::default(), &CancellationToken::new())
            .unwrap();

        // root, header, two distinct pixel values
        assert_eq!(output.atoms().len(), 4);
        assert_eq!(output.relations().len(), 5);
        let bottom_right = output
            .relations()
            .iter()
            .find(|relation| relation.sequence_index == Some(4))
            .unwrap();
        assert_eq!(bottom_right.spatial, Some(SpatialMetadata::Pixel { x: 1, y: 1 }));
    }

    #[test]
    fn truncated_pixels_fall_back_to_binary() {
        let output = registry()
            .atomize(b"P5 4 4 255\n\x00", &SourceMetadata::named("bad.pgm"), AtomizeLimits::default(), &CancellationToken::new())
            .unwrap();
        assert!(output.has_warning(WarningCode::MalformedContent));
        assert_eq!(output.root().subtype, "file");
    }

    #[test]
    fn pixel_cap_warns() {
        let mut image = b"P5 3 3 255\n".to_vec();
        image.extend(0..9_u8);
        let limits = AtomizeLimits {
            max_tensor_elements: 4,
            ..AtomizeLimits::default()
        };
        let output = registry()
            .atomize(&image, &SourceMetadata::named("a.pgm"), limits, &CancellationToken::new())
            .unwrap();
        assert!(output.has_warning(WarningCode::ElementLimitReached));
        assert_eq!(output.relations().len(), 1 + 4);
    }
}

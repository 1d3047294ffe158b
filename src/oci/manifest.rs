//! Manifest and layer types, plus the layer-role classification of §6.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The annotation key carrying the authoritative uncompressed disk size.
pub const UNCOMPRESSED_SIZE_ANNOTATION: &str = "com.trycua.lume.disk.uncompressed_size";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Equality is structural over `media_type`, `digest`, and `size` only (§3) —
/// annotations don't participate in cache validation.
impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.media_type == other.media_type && self.digest == other.digest && self.size == other.size
    }
}
impl Eq for Layer {}

impl Layer {
    /// The digest with `:` replaced by `_`, as used for the on-disk cache filename (I2).
    pub fn digest_filename(&self) -> String {
        self.digest.replace(':', "_")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Layer>,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl Manifest {
    /// Layer lists are compared for structural equality (§4.2 `validate`);
    /// the config descriptor participates too since it's also a `Layer`.
    pub fn layers_match(&self, other: &Manifest) -> bool {
        self.config == other.config && self.layers == other.layers
    }

    pub fn uncompressed_size_annotation(&self) -> Option<u64> {
        self.config
            .as_ref()?
            .annotation(UNCOMPRESSED_SIZE_ANNOTATION)?
            .parse()
            .ok()
    }
}

/// The manifest's own digest with `:` replaced by `_` — the cache directory name (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestId(String);

impl ManifestId {
    pub fn from_digest(digest: &str) -> Self {
        Self(digest.replace(':', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ManifestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The decoder a disk-chunk or whole-disk layer needs before its bytes are sparse-written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    None,
    Gzip,
    Lz4,
    AppleArchive,
}

/// What a layer becomes once pulled, per the §6 media-type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerRole {
    Config,
    Nvram,
    WholeDisk { decoder: Decoder },
    DiskChunk { ordinal: u32, decoder: Decoder },
    Empty,
}

const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const TAR_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
const OCTET_STREAM: &str = "application/octet-stream";
const OCTET_STREAM_GZIP: &str = "application/octet-stream+gzip";
const EMPTY_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";

/// Classifies every layer in manifest order, resolving the `application/octet-stream`
/// ambiguity (nvram vs. whole-disk) using whether a config-role layer exists elsewhere
/// in the same manifest, and assigning sequential ordinals to chunks that don't carry
/// an explicit `part.number` parameter.
///
/// `manifest_has_config` is whether the manifest's own `config` descriptor is
/// present — the usual place a config object lives — in addition to any
/// `application/vnd.oci.image.config.v1+json` entry found inside `layers`
/// itself (some manifests redundantly repeat it there).
pub fn classify_layers(layers: &[Layer], manifest_has_config: bool) -> Vec<LayerRole> {
    let has_config_layer =
        manifest_has_config || layers.iter().any(|l| l.media_type == CONFIG_MEDIA_TYPE);

    let mut next_sequential_ordinal = 1u32;
    layers
        .iter()
        .map(|layer| classify_one(layer, has_config_layer, &mut next_sequential_ordinal))
        .collect()
}

fn classify_one(layer: &Layer, has_config_layer: bool, next_ordinal: &mut u32) -> LayerRole {
    let mt = layer.media_type.as_str();

    if mt == EMPTY_MEDIA_TYPE {
        return LayerRole::Empty;
    }
    if mt == CONFIG_MEDIA_TYPE {
        return LayerRole::Config;
    }

    if let Some(ordinal) = parse_part_number(mt) {
        let decoder = decoder_for(mt);
        return LayerRole::DiskChunk { ordinal, decoder };
    }

    if mt.ends_with("+lz4") {
        let ordinal = *next_ordinal;
        *next_ordinal += 1;
        return LayerRole::DiskChunk {
            ordinal,
            decoder: Decoder::Lz4,
        };
    }
    if mt.ends_with("+lzfse") || mt.ends_with("+aa") {
        let ordinal = *next_ordinal;
        *next_ordinal += 1;
        return LayerRole::DiskChunk {
            ordinal,
            decoder: Decoder::AppleArchive,
        };
    }

    if mt == OCTET_STREAM_GZIP {
        return LayerRole::WholeDisk {
            decoder: Decoder::Gzip,
        };
    }
    if mt == TAR_MEDIA_TYPE {
        return LayerRole::WholeDisk {
            decoder: Decoder::None,
        };
    }
    if mt == OCTET_STREAM {
        return if has_config_layer {
            LayerRole::Nvram
        } else {
            LayerRole::WholeDisk {
                decoder: Decoder::None,
            }
        };
    }

    // Unknown media types fall back to an uncompressed whole-disk layer rather
    // than being silently dropped.
    LayerRole::WholeDisk {
        decoder: Decoder::None,
    }
}

fn decoder_for(media_type: &str) -> Decoder {
    let base = media_type.split(';').next().unwrap_or(media_type);
    if base.ends_with("+lz4") {
        Decoder::Lz4
    } else if base.ends_with("+lzfse") || base.ends_with("+aa") {
        Decoder::AppleArchive
    } else if base.ends_with("+gzip") {
        Decoder::Gzip
    } else {
        Decoder::None
    }
}

/// Parses `part.number=<N>` out of a media-type parameter string, if present.
fn parse_part_number(media_type: &str) -> Option<u32> {
    media_type.split(';').find_map(|segment| {
        let segment = segment.trim();
        segment
            .strip_prefix("part.number=")
            .and_then(|n| n.trim().parse().ok())
    })
}

/// Parses `part.total=<T>` out of a media-type parameter string, if present.
fn parse_part_total(media_type: &str) -> Option<u32> {
    media_type.split(';').find_map(|segment| {
        let segment = segment.trim();
        segment
            .strip_prefix("part.total=")
            .and_then(|n| n.trim().parse().ok())
    })
}

/// The number of disk-chunk parts this manifest declares, per §6: taken from
/// any layer's `part.total` media-type parameter when present, otherwise from
/// the count of layers classified as `DiskChunk`. `None` when there are no
/// disk chunks at all (e.g. a whole-disk or config-only manifest).
pub fn expected_chunk_total(layers: &[Layer], roles: &[LayerRole]) -> Option<u32> {
    if let Some(total) = layers.iter().find_map(|l| parse_part_total(&l.media_type)) {
        return Some(total);
    }

    let chunk_count = roles.iter().filter(|r| matches!(r, LayerRole::DiskChunk { .. })).count() as u32;
    if chunk_count > 0 {
        Some(chunk_count)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(media_type: &str) -> Layer {
        Layer {
            media_type: media_type.to_string(),
            digest: "sha256:deadbeef".to_string(),
            size: 10,
            annotations: None,
        }
    }

    #[test]
    fn classifies_config_and_nvram() {
        let layers = vec![layer(CONFIG_MEDIA_TYPE), layer(OCTET_STREAM)];
        let roles = classify_layers(&layers, false);
        assert_eq!(roles[0], LayerRole::Config);
        assert_eq!(roles[1], LayerRole::Nvram);
    }

    #[test]
    fn manifest_level_config_also_triggers_nvram_classification() {
        // The config descriptor lives in `manifest.config`, not `layers` — the
        // usual OCI shape — so `layers` carries only the nvram blob.
        let layers = vec![layer(OCTET_STREAM)];
        let roles = classify_layers(&layers, true);
        assert_eq!(roles[0], LayerRole::Nvram);
    }

    #[test]
    fn octet_stream_without_config_is_whole_disk() {
        let layers = vec![layer(OCTET_STREAM)];
        let roles = classify_layers(&layers, false);
        assert_eq!(
            roles[0],
            LayerRole::WholeDisk {
                decoder: Decoder::None
            }
        );
    }

    #[test]
    fn explicit_part_number_wins_over_sequential() {
        let layers = vec![
            layer("application/octet-stream+lz4;part.number=2;part.total=2"),
            layer("application/octet-stream+lz4;part.number=1;part.total=2"),
        ];
        let roles = classify_layers(&layers, false);
        assert_eq!(
            roles[0],
            LayerRole::DiskChunk {
                ordinal: 2,
                decoder: Decoder::Lz4
            }
        );
        assert_eq!(
            roles[1],
            LayerRole::DiskChunk {
                ordinal: 1,
                decoder: Decoder::Lz4
            }
        );
    }

    #[test]
    fn sequential_ordinals_when_no_part_number() {
        let layers = vec![layer("application/octet-stream+lz4"), layer("application/octet-stream+lz4")];
        let roles = classify_layers(&layers, false);
        assert_eq!(
            roles[0],
            LayerRole::DiskChunk {
                ordinal: 1,
                decoder: Decoder::Lz4
            }
        );
        assert_eq!(
            roles[1],
            LayerRole::DiskChunk {
                ordinal: 2,
                decoder: Decoder::Lz4
            }
        );
    }

    #[test]
    fn empty_layer_is_skipped() {
        let layers = vec![layer(EMPTY_MEDIA_TYPE)];
        assert_eq!(classify_layers(&layers, false)[0], LayerRole::Empty);
    }

    #[test]
    fn expected_chunk_total_prefers_part_total_annotation() {
        let layers = vec![
            layer("application/octet-stream+lz4;part.number=1;part.total=3"),
            layer("application/octet-stream+lz4;part.number=2;part.total=3"),
        ];
        let roles = classify_layers(&layers, false);
        assert_eq!(expected_chunk_total(&layers, &roles), Some(3));
    }

    #[test]
    fn expected_chunk_total_falls_back_to_chunk_count() {
        let layers = vec![layer("application/octet-stream+lz4"), layer("application/octet-stream+lz4")];
        let roles = classify_layers(&layers, false);
        assert_eq!(expected_chunk_total(&layers, &roles), Some(2));
    }

    #[test]
    fn expected_chunk_total_is_none_without_disk_chunks() {
        let layers = vec![layer(CONFIG_MEDIA_TYPE)];
        let roles = classify_layers(&layers, false);
        assert_eq!(expected_chunk_total(&layers, &roles), None);
    }
}

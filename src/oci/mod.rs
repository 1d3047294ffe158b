//! Registry transport: reference parsing, manifest/layer types, token negotiation,
//! and the HTTP client used to fetch manifests and blobs (C1).

pub mod client;
pub mod manifest;
pub mod reference;
pub mod token;

pub use client::RegistryClient;
pub use manifest::{classify_layers, expected_chunk_total, Decoder, Layer, LayerRole, Manifest, ManifestId};
pub use reference::ImageReference;

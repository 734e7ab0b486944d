use constcat::concat;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifying token of the in-cluster proxy image; the resolver matches it
/// against container image references.
pub const IMAGE_NAME: &str = "telepresence-k8s";

pub const DEFAULT_REGISTRY: &str = "datawire";

pub const DEFAULT_IMAGE: &str = concat!(DEFAULT_REGISTRY, "/", IMAGE_NAME);

/// The version string used for the proxy image tag and the compatibility
/// check. `TELEPRESENCE_VERSION` overrides the compiled-in version.
pub fn version() -> String {
    std::env::var("TELEPRESENCE_VERSION").unwrap_or_else(|_| VERSION.to_owned())
}

/// The registry the proxy image is pulled from; `TELEPRESENCE_REGISTRY`
/// overrides the default.
pub fn registry() -> String {
    std::env::var("TELEPRESENCE_REGISTRY").unwrap_or_else(|_| DEFAULT_REGISTRY.to_owned())
}

/// Full image reference for the in-cluster proxy matching this binary.
pub fn companion_image() -> String {
    format!("{}/{}:{}", registry(), IMAGE_NAME, version())
}

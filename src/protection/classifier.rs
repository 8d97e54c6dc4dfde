use crate::models::request::RequestClass;

/// Markers that identify a static asset anywhere in a request path.
const ASSET_PATTERNS: &[&str] = &[".jpg", ".png", ".css", ".js", ".gif", ".ico"];

/// Splits requests into application (HTML/API) and static-asset traffic.
///
/// Matching is case-sensitive and not anchored to the end of the path, so
/// `/bundle.js?v=3` and `/static/css.js.map` are both assets.
pub struct AssetClassifier {
    patterns: &'static [&'static str],
}

impl AssetClassifier {
    pub fn new() -> Self {
        Self {
            patterns: ASSET_PATTERNS,
        }
    }

    pub fn classify(&self, path: &str) -> RequestClass {
        if self.patterns.iter().any(|p| path.contains(p)) {
            RequestClass::Asset
        } else {
            RequestClass::Application
        }
    }
}

impl Default for AssetClassifier {
    fn default() -> Self {
        Self::new()
    }
}

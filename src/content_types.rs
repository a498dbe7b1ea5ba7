//! Short content-type names understood by `type_()` and `accept()`.

use std::path::Path;

pub const JSON: &str = "application/json";
pub const FORM: &str = "application/x-www-form-urlencoded";
pub const OCTET_STREAM: &str = "application/octet-stream";

const REGISTRY: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("json", JSON),
    ("xml", "application/xml"),
    ("text", "text/plain"),
    ("form", FORM),
    ("form-data", FORM),
];

/// Looks up a short name like `"json"`. Returns `None` for unknown names.
pub fn lookup(name: &str) -> Option<&'static str> {
    REGISTRY
        .iter()
        .find(|(short, _)| *short == name)
        .map(|(_, mime)| *mime)
}

/// Resolves a short name through the registry, or returns the input verbatim.
pub fn resolve(name: &str) -> String {
    lookup(name).map(str::to_string).unwrap_or_else(|| name.to_string())
}

/// MIME type for a file, guessed from its extension.
pub fn for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Strips parameters and lower-cases a `Content-Type` value.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_json(content_type: &str) -> bool {
    let essence = essence(content_type);
    essence == JSON || essence.ends_with("+json")
}

pub fn is_form(content_type: &str) -> bool {
    essence(content_type) == FORM
}

pub fn is_image(content_type: &str) -> bool {
    essence(content_type).starts_with("image/")
}

pub struct GantryPath;

impl GantryPath {
    /// Standardize directory separators to forward slashes. This is the wire
    /// format for ledger keys and summary paths.
    pub fn normalize(path: &str) -> String {
        path.replace('\\', "/")
    }

    /// Sanitize a path to prevent directory traversal from a malicious
    /// package or diff summary.
    pub fn verify_safe(rel_path: &str) -> bool {
        let p = std::path::Path::new(rel_path);
        !p.is_absolute()
            && !p
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
    }
}

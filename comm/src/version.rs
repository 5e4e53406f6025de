//! Core device runtime / host software version compatibility.

/// Whether two software versions speak incompatible protocols.
///
/// Beta versions may change the protocol at any point, so they only match
/// exactly; on stable versions compatibility is maintained within a major
/// version.
pub fn incompatible_versions(v1: &str, v2: &str) -> bool {
    if v1.ends_with(".beta") || v2.ends_with(".beta") {
        v1 != v2
    } else {
        fn major(version: &str) -> &str {
            version.split('.').next().unwrap_or(version)
        }
        major(v1) != major(v2)
    }
}

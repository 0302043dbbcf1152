/// Explicit paths replace the current one; otherwise the prefix is prepended.
/// Duplicates keep their first position.
pub fn merge_search_path(explicit: &[String], prefix: &[String], current: &[String]) -> Vec<String> {
    let candidates: Vec<&String> = if explicit.is_empty() {
        prefix.iter().chain(current.iter()).collect()
    } else {
        explicit.iter().collect()
    };
    let mut merged: Vec<String> = Vec::with_capacity(candidates.len());
    for schema in candidates {
        let schema = schema.trim();
        if schema.is_empty() || merged.iter().any(|existing| existing == schema) {
            continue;
        }
        merged.push(schema.to_string());
    }
    merged
}

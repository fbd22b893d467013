use crate::tokens::hash_token;

/// SHA-256 hex of the `|`-joined fingerprint components.
pub fn hash_fingerprint<I, S>(components: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = components
        .into_iter()
        .map(|part| part.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("|");
    hash_token(&joined)
}

/// Search variants for an owner name: as typed, upper, lower and whitespace-collapsed
pub fn owner_variants(name: &str) -> Vec<String> {
    let trimmed = name.trim();
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut variants: Vec<String> = Vec::new();
    for candidate in [
        trimmed.to_string(),
        trimmed.to_uppercase(),
        trimmed.to_lowercase(),
        collapsed,
    ] {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Whether an extracted owner name matches the searched name.
///
/// Case-insensitive containment either way, any variant contained in the
/// owner, or a token pair within one edit for tokens of five or more chars.
pub fn is_owner_match(owner_name: &str, search_name: &str, variants: &[String]) -> bool {
    let owner = normalize(owner_name);
    let search = normalize(search_name);

    if search.is_empty() || owner.is_empty() {
        return false;
    }

    if owner.contains(&search) || search.contains(&owner) {
        return true;
    }

    if variants
        .iter()
        .map(|v| normalize(v))
        .any(|v| !v.is_empty() && owner.contains(&v))
    {
        return true;
    }

    let owner_tokens: Vec<&str> = owner.split(' ').collect();
    search
        .split(' ')
        .filter(|token| token.chars().count() >= 5)
        .any(|token| {
            owner_tokens
                .iter()
                .filter(|candidate| candidate.chars().count() >= 5)
                .any(|candidate| strsim::levenshtein(token, candidate) <= 1)
        })
}

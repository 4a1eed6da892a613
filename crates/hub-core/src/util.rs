//! Small string helpers shared by components that mint entity ids

/// Turn a display name into an object-id safe slug
///
/// Spaces and dashes become underscores, everything outside `[a-z0-9_]` is
/// dropped, runs of underscores collapse and the result never starts or
/// ends with one.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());

    for c in text.chars() {
        let c = match c {
            ' ' | '-' | '_' | '.' => '_',
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase(),
            _ => continue,
        };
        if c == '_' && (slug.is_empty() || slug.ends_with('_')) {
            continue;
        }
        slug.push(c);
    }

    while slug.ends_with('_') {
        slug.pop();
    }

    slug
}

/// Return `preferred`, or `preferred_2`, `preferred_3`, ... whichever is
/// the first not already in `taken`
pub fn ensure_unique_string<'a, I>(preferred: &str, taken: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: Vec<&str> = taken.into_iter().collect();
    let mut candidate = preferred.to_string();
    let mut tries = 1;

    while taken.contains(&candidate.as_str()) {
        tries += 1;
        candidate = format!("{}_{}", preferred, tries);
    }

    candidate
}

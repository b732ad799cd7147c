//! Name handling: URL slugs, cross-reference matching, track classification

use crate::adapters::{ArchiveArtist, CatalogArtist};

/// Track-title fragments marking a live recording
const LIVE_PATTERNS: &[&str] = &[
    "- live",
    "(live",
    "[live",
    "live at ",
    "live from ",
    "live in ",
    "live version",
    "- unplugged",
    "(unplugged",
];

/// Track-title fragments marking a remix or alternate mix
const REMIX_PATTERNS: &[&str] = &["remix", "rmx", "- mix", "(mix", " mix)", " dub)", "- radio edit"];

/// URL slug for an artist name
///
/// Lowercase ASCII letters and digits separated by single hyphens. Common
/// Latin accents are folded; a name with nothing usable becomes `artist`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        let folded: Option<&str> = match c {
            '&' => Some("and"),
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => Some("a"),
            'ç' | 'Ç' => Some("c"),
            'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => Some("e"),
            'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => Some("i"),
            'ñ' | 'Ñ' => Some("n"),
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => Some("o"),
            'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => Some("u"),
            'ý' | 'ÿ' | 'Ý' => Some("y"),
            'ß' => Some("ss"),
            _ => None,
        };

        // Apostrophes join words: "Guns N' Roses" -> "guns-n-roses"
        if c == '\'' || c == '\u{2019}' {
            continue;
        }

        match folded {
            Some(text) => {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push_str(text);
            }
            None if c.is_ascii_alphanumeric() => {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(c.to_ascii_lowercase());
            }
            None => pending_dash = true,
        }
    }

    if slug.is_empty() {
        "artist".to_string()
    } else {
        slug
    }
}

/// Slug candidate for attempt `n`: the base, then `base-1`, `base-2`, ...
pub fn slug_candidate(base: &str, n: u32) -> String {
    if n == 0 {
        base.to_string()
    } else {
        format!("{base}-{n}")
    }
}

pub fn is_live(title: &str) -> bool {
    let title = title.to_lowercase();
    LIVE_PATTERNS.iter().any(|p| title.contains(p))
}

pub fn is_remix(title: &str) -> bool {
    let title = title.to_lowercase();
    REMIX_PATTERNS.iter().any(|p| title.contains(p))
}

/// Catalog artist for `name`: exact case-insensitive match, else the most
/// popular candidate
pub fn pick_catalog_artist<'a>(name: &str, candidates: &'a [CatalogArtist]) -> Option<&'a CatalogArtist> {
    let wanted = name.to_lowercase();
    candidates
        .iter()
        .find(|c| c.name.to_lowercase() == wanted)
        .or_else(|| candidates.iter().max_by_key(|c| c.popularity.unwrap_or(0)))
}

/// Archive artist for `name`: exact case-insensitive match only
pub fn pick_archive_artist<'a>(name: &str, candidates: &'a [ArchiveArtist]) -> Option<&'a ArchiveArtist> {
    let wanted = name.to_lowercase();
    candidates.iter().find(|c| c.name.to_lowercase() == wanted)
}

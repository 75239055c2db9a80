use crate::core::error::ValidationError;
use crate::core::model::ItemId;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Widest range a single specifier may expand to.
pub const MAX_RANGE_SPAN: u64 = 10_000;

/// Expands `"1, 3-5, 9"` into item ids.
///
/// Tokens are comma separated; each is a literal id or an inclusive numeric
/// range `lo-hi`. Purely numeric literals are canonicalised (`"07"` -> `"7"`)
/// so they deduplicate against range members. The whole string is validated
/// before anything is returned.
pub fn expand_specifiers(input: &str, sorted: bool) -> Result<Vec<ItemId>, ValidationError> {
    let mut seen: HashSet<ItemId> = HashSet::new();
    let mut ids: Vec<ItemId> = Vec::new();

    let mut push = |id: ItemId, ids: &mut Vec<ItemId>| {
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    };

    for token in input.split(',').map(str::trim) {
        if token.is_empty() {
            continue;
        }

        match token.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_endpoint(token, lo)?;
                let hi = parse_endpoint(token, hi)?;
                if lo > hi {
                    return Err(ValidationError::BadSpecifier {
                        spec: token.to_string(),
                        reason: format!("range start {lo} is greater than end {hi}"),
                    });
                }
                if hi - lo >= MAX_RANGE_SPAN {
                    return Err(ValidationError::RangeTooWide { lo, hi, max: MAX_RANGE_SPAN });
                }
                for n in lo..=hi {
                    push(n.to_string(), &mut ids);
                }
            }
            None => {
                let id = match token.parse::<u64>() {
                    Ok(n) => n.to_string(),
                    Err(_) => token.to_string(),
                };
                push(id, &mut ids);
            }
        }
    }

    if ids.is_empty() {
        return Err(ValidationError::Empty);
    }

    if sorted {
        ids.sort_by(compare_ids);
    }
    Ok(ids)
}

fn parse_endpoint(spec: &str, raw: &str) -> Result<u64, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::BadSpecifier {
            spec: spec.to_string(),
            reason: "empty range endpoint".to_string(),
        });
    }
    raw.parse::<u64>().map_err(|_| ValidationError::BadSpecifier {
        spec: spec.to_string(),
        reason: format!("range endpoint {raw:?} is not a number"),
    })
}

/// Numeric ids ascending, then non-numeric ids lexicographically.
pub fn compare_ids(a: &ItemId, b: &ItemId) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

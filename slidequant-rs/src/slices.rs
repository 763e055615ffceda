use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Parse a selection like "all", "1,3", "0:10:2" or "-2:" into sorted,
/// deduplicated indices below `length`. Slice bounds follow Python
/// `slice.indices` clamping; a bare index must be in range.
pub fn parse_selection(expr: &str, length: usize) -> Result<Vec<usize>> {
    let expr = expr.trim();
    if expr.eq_ignore_ascii_case("all") {
        return Ok((0..length).collect());
    }

    let len = length as isize;
    let mut picked = BTreeSet::new();

    for segment in expr.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !segment.contains(':') {
            let idx: isize = segment
                .parse()
                .map_err(|_| invalid_segment(segment))?;
            if idx < -len || idx >= len {
                return Err(Error::InvalidInput(format!(
                    "Index {} out of range for {} items",
                    idx, length
                )));
            }
            let idx = if idx < 0 { idx + len } else { idx };
            picked.insert(idx as usize);
            continue;
        }

        let bounds = segment
            .split(':')
            .map(|p| match p.trim() {
                "" => Ok(None),
                t => t.parse::<isize>().map(Some).map_err(|_| invalid_segment(segment)),
            })
            .collect::<Result<Vec<_>>>()?;
        if bounds.len() > 3 {
            return Err(invalid_segment(segment));
        }
        let step = bounds.get(2).copied().flatten().unwrap_or(1);
        if step == 0 {
            return Err(Error::InvalidInput(format!(
                "Slice step cannot be zero: {:?}",
                segment
            )));
        }
        let (default_start, default_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
        let start = bounds[0].map_or(default_start, |s| clamp_bound(s, len, step));
        let stop = bounds
            .get(1)
            .copied()
            .flatten()
            .map_or(default_stop, |s| clamp_bound(s, len, step));

        let mut idx = start;
        while (step > 0 && idx < stop) || (step < 0 && idx > stop) {
            picked.insert(idx as usize);
            idx += step;
        }
    }

    Ok(picked.into_iter().collect())
}

fn clamp_bound(bound: isize, len: isize, step: isize) -> isize {
    let b = if bound < 0 { bound + len } else { bound };
    if step > 0 {
        b.clamp(0, len)
    } else {
        b.clamp(-1, len - 1)
    }
}

fn invalid_segment(segment: &str) -> Error {
    Error::InvalidInput(format!("Invalid slice segment: {:?}", segment))
}

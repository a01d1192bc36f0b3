//! Multi-volume RAR naming: identifying archive names, telling first
//! volumes apart from continuations, and generating the name of the n-th
//! volume of an archive.

use std::sync::LazyLock;

use regex::Regex;

/// Matches `.partNN.rar`, `.rNN`/`.rar`, or a plain trailing `NN`/`NNN` run,
/// case-insensitively, identifying a file as (part of) a RAR archive.
static RAR_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^.*?(?:\.part(\d{2,3})\.rar|\.r(ar|\d{2})|(\d{2,3}))$").unwrap()
});

/// Does `name` look like it belongs to a RAR archive (any volume)?
pub fn is_rar_name(name: &str) -> bool {
    RAR_NAME_RE.is_match(name)
}

/// Does `name` look like the *first* volume of a multi-volume archive, or
/// a standalone single-volume archive?
pub fn is_first_volume(name: &str) -> bool {
    let Some(captures) = RAR_NAME_RE.captures(name) else {
        return false;
    };

    if let Some(part) = captures.get(1) {
        return part.as_str() == "001" || part.as_str() == "01";
    }
    // The pattern is matched case-insensitively, but this comparison is not:
    // ".RAR" does not count as a first volume, only ".rar" does.
    if let Some(rext) = captures.get(2) {
        return rext.as_str() == "ar";
    }
    if let Some(plain) = captures.get(3) {
        // Only "001" counts here, not "01": the reference implementation's
        // own first-volume check (`m.group(3) == '001'`) deliberately
        // excludes the bare two-digit form for this branch, unlike group 1
        // (the `.partNN.rar` branch), which accepts both widths.
        return plain.as_str() == "001";
    }
    false
}

/// Whether a volume-naming scheme uses the "new" (`.partNN.rar`-for-all,
/// zero-padded trailing digit run) convention or the "old" one
/// (`.rar`, `.r00`, `.r01`, ..., `.s00`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numbering {
    Old,
    New,
}

/// The last maximal run of ASCII digits in `name`, anchored so that only
/// non-digit characters may follow it.
fn trailing_digit_run(name: &str) -> Option<(usize, usize)> {
    let bytes = name.as_bytes();
    let mut end = None;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        if bytes[i].is_ascii_digit() {
            end = Some(i + 1);
            break;
        }
    }
    let end = end?;
    let mut start = end;
    while start > 0 && bytes[start - 1].is_ascii_digit() {
        start -= 1;
    }
    Some((start, end))
}

/// Compute the path of the `volume`-th (0-indexed) volume of the archive
/// whose first volume lives at `base`, given the archive's numbering
/// scheme.
///
/// `gen(base, 0) == base` always holds.
pub fn volume_name(base: &str, volume: u32, numbering: Numbering) -> Option<String> {
    if volume == 0 {
        return Some(base.to_owned());
    }

    match numbering {
        Numbering::New => {
            let (start, end) = trailing_digit_run(base)?;
            let width = end - start;
            let replacement = format!("{:0width$}", volume + 1, width = width);
            Some(format!("{}{}{}", &base[..start], replacement, &base[end..]))
        }
        Numbering::Old => {
            let dot = base.rfind('.')?;
            let stem = &base[..dot];
            let suffix = if base.ends_with("001") {
                format!(".{:03}", volume + 1)
            } else if volume <= 100 {
                format!(".r{:02}", volume - 1)
            } else {
                format!(".s{:02}", volume - 101)
            };
            Some(format!("{stem}{suffix}"))
        }
    }
}

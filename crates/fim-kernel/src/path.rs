//! Path grammar for addressing model and schema nodes.
//!
//! A path is a `/`-separated list of segments. Each segment is a name optionally followed by
//! an array suffix (`name[3]` for access, `name[]` for a schema definition), or a name prefixed
//! by `#` (attribute) or `@` (namespace). Prefixed segments may only appear last.

pub const PATH_SEPARATOR: &str = "/";

/// Array suffix carried by a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayIndex {
    /// `name[]`, only legal in definitions.
    Definition,
    /// `name[idx]`
    Access(usize),
}

/// Node class a segment addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Data,
    Namespace,
    Attribute,
}

/// A parsed path segment borrowing from the source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub name: &'a str,
    pub kind: SegmentKind,
    pub index: Option<ArrayIndex>,
}

impl Segment<'_> {
    pub fn is_array(&self) -> bool {
        self.index.is_some()
    }
}

pub fn split_full_path(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR).collect()
}

/// Joins segments with the separator, skipping empty ones.
pub fn concat_full_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(PATH_SEPARATOR)
}

pub fn concat_full_pipeline_name(service: &str, pipeline: &str) -> String {
    format!("{service}{PATH_SEPARATOR}{pipeline}")
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Parses one segment. `[]` is only accepted when `allow_definition` is set.
pub fn parse_segment(segment: &str, allow_definition: bool) -> Option<Segment<'_>> {
    if let Some(rest) = segment.strip_prefix('#') {
        return is_valid_name(rest).then_some(Segment {
            name: rest,
            kind: SegmentKind::Attribute,
            index: None,
        });
    }
    if let Some(rest) = segment.strip_prefix('@') {
        return is_valid_name(rest).then_some(Segment {
            name: rest,
            kind: SegmentKind::Namespace,
            index: None,
        });
    }

    let (name, index) = match segment.strip_suffix(']') {
        Some(head) => {
            let open = head.find('[')?;
            let (name, digits) = (&head[..open], &head[open + 1..]);
            if digits.is_empty() {
                if !allow_definition {
                    return None;
                }
                (name, Some(ArrayIndex::Definition))
            } else if digits.bytes().all(|b| b.is_ascii_digit()) {
                (name, Some(ArrayIndex::Access(digits.parse().ok()?)))
            } else {
                return None;
            }
        }
        None => (segment, None),
    };

    is_valid_name(name).then_some(Segment {
        name,
        kind: SegmentKind::Data,
        index,
    })
}

/// Parses a full path, enforcing that namespace/attribute segments only appear last.
pub fn parse_full_path(path: &str, allow_definition: bool) -> Option<Vec<Segment<'_>>> {
    if path.is_empty() {
        return None;
    }
    let raw = split_full_path(path);
    let last = raw.len() - 1;
    let mut segments = Vec::with_capacity(raw.len());
    for (i, s) in raw.into_iter().enumerate() {
        let seg = parse_segment(s, allow_definition)?;
        if seg.kind != SegmentKind::Data && i != last {
            return None;
        }
        segments.push(seg);
    }
    Some(segments)
}

/// Validates a runtime path: array definitions (`name[]`) are rejected.
pub fn validate_full_path(path: &str) -> bool {
    parse_full_path(path, false).is_some()
}

/// Validates a definition path: array definitions (`name[]`) are allowed.
pub fn validate_full_path_of_definition(path: &str) -> bool {
    parse_full_path(path, true).is_some()
}

/// Splits an array suffix from a single segment.
///
/// Returns the bare name and the suffix, if any. Segments that do not carry a well-formed
/// suffix are returned unchanged with `None`.
pub fn extract_array_path(segment: &str) -> (&str, Option<ArrayIndex>) {
    match parse_segment(segment, true) {
        Some(Segment {
            name,
            kind: SegmentKind::Data,
            index,
        }) => (name, index),
        _ => (segment, None),
    }
}

/// Re-inserts an array suffix onto a bare name.
pub fn with_array_index(name: &str, index: Option<ArrayIndex>) -> String {
    match index {
        None => name.to_string(),
        Some(ArrayIndex::Definition) => format!("{name}[]"),
        Some(ArrayIndex::Access(i)) => format!("{name}[{i}]"),
    }
}

pub fn is_path_array(segment: &str) -> bool {
    extract_array_path(segment).1.is_some()
}

pub fn is_array_definition(segment: &str) -> bool {
    matches!(extract_array_path(segment).1, Some(ArrayIndex::Definition))
}

pub fn is_array_access(segment: &str) -> bool {
    matches!(extract_array_path(segment).1, Some(ArrayIndex::Access(_)))
}

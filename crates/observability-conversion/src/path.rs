//! Addressing of individual fields inside a resource's JSON tree.
//!
//! A [`FieldPath`] is written in the usual dotted notation, for example
//! `spec.components.prometheus.remoteWrite[0].url`. Keys which cannot be
//! written bare (because they contain `.`, `[`, `]`, `"` or `\`) are quoted:
//! `spec.nodeSelector["kubernetes.io/os"]`. The empty index `[]` matches any
//! array element and is used by schemas and mapping tables to describe fields
//! of array items.
use std::{fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use snafu::{OptionExt, Snafu, ensure};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParsePathError {
    #[snafu(display("field path must not be empty"))]
    Empty,

    #[snafu(display("field path contains an empty segment at position {position}"))]
    EmptySegment { position: usize },

    #[snafu(display("unexpected character {character:?} at position {position}"))]
    UnexpectedCharacter { character: char, position: usize },

    #[snafu(display("unterminated bracket starting at position {position}"))]
    UnterminatedBracket { position: usize },

    #[snafu(display("invalid array index {index:?}"))]
    InvalidIndex { index: String },
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SetFieldError {
    #[snafu(display("cannot descend into {path}, it is neither an object nor an array"))]
    NotAContainer { path: FieldPath },

    #[snafu(display("cannot write to {path}, it contains a wildcard index"))]
    WildcardIndex { path: FieldPath },

    #[snafu(display("index {index} at {path} is past the end of an array of length {len}"))]
    IndexOutOfRange {
        path: FieldPath,
        index: usize,
        len: usize,
    },
}

/// A single step of a [`FieldPath`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Index(usize),

    /// Matches every element of an array, written as `[]`.
    AnyIndex,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    /// Creates a path consisting of the single top-level `key`.
    pub fn root(key: impl Into<String>) -> Self {
        Self(vec![Segment::Key(key.into())])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment::Key(key.into()));
        Self(segments)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment::Index(index));
        Self(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        match self.0.split_last() {
            Some((_, rest)) if !rest.is_empty() => Some(Self(rest.to_vec())),
            _ => None,
        }
    }

    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    /// Returns every proper ancestor, starting with the top-level one.
    pub fn ancestors(&self) -> impl Iterator<Item = Self> + '_ {
        (1..self.0.len()).map(|len| Self(self.0[..len].to_vec()))
    }

    /// Returns the key under which schemas declare this path: concrete indices
    /// are replaced by `[]`.
    pub fn schema_key(&self) -> String {
        let generic = Self(
            self.0
                .iter()
                .map(|segment| match segment {
                    Segment::Index(_) => Segment::AnyIndex,
                    other => other.clone(),
                })
                .collect(),
        );
        generic.to_string()
    }

    /// Returns `true` if this concrete path is described by `pattern`, which
    /// may contain `[]` wildcards.
    pub fn matches(&self, pattern: &Self) -> bool {
        self.0.len() == pattern.0.len() && Self::segments_match(&self.0, &pattern.0)
    }

    /// Returns `true` if this path is a proper ancestor of something described
    /// by `pattern`.
    pub fn is_ancestor_of(&self, pattern: &Self) -> bool {
        self.0.len() < pattern.0.len() && Self::segments_match(&self.0, &pattern.0[..self.0.len()])
    }

    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns the concrete indices in order of appearance.
    pub fn indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .filter_map(|segment| match segment {
                Segment::Index(index) => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Replaces the `[]` wildcards of this pattern with `indices`, in order.
    /// Surplus wildcards stay in place.
    pub fn with_indices(&self, indices: &[usize]) -> Self {
        let mut indices = indices.iter();
        Self(
            self.0
                .iter()
                .map(|segment| match segment {
                    Segment::AnyIndex => indices
                        .next()
                        .map_or(Segment::AnyIndex, |index| Segment::Index(*index)),
                    other => other.clone(),
                })
                .collect(),
        )
    }

    pub fn has_wildcard(&self) -> bool {
        self.0.contains(&Segment::AnyIndex)
    }

    fn segments_match(concrete: &[Segment], pattern: &[Segment]) -> bool {
        concrete.iter().zip(pattern).all(|(lhs, rhs)| {
            matches!(
                (lhs, rhs),
                (Segment::Index(_) | Segment::AnyIndex, Segment::AnyIndex)
            ) || lhs == rhs
        })
    }
}

impl FromStr for FieldPath {
    type Err = ParsePathError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ensure!(!input.is_empty(), EmptySnafu);

        let chars: Vec<char> = input.chars().collect();
        let mut segments = Vec::new();
        let mut position = 0;

        while position < chars.len() {
            match chars[position] {
                '[' => {
                    let (segment, next) = parse_bracket(&chars, position)?;
                    segments.push(segment);
                    position = next;
                }
                '.' if !segments.is_empty() => {
                    let (key, next) = parse_bare_key(&chars, position + 1)?;
                    segments.push(Segment::Key(key));
                    position = next;
                }
                character if segments.is_empty() && character != '.' => {
                    let (key, next) = parse_bare_key(&chars, position)?;
                    segments.push(Segment::Key(key));
                    position = next;
                }
                character => {
                    return UnexpectedCharacterSnafu {
                        character,
                        position,
                    }
                    .fail();
                }
            }
        }

        Ok(Self(segments))
    }
}

fn parse_bare_key(chars: &[char], start: usize) -> Result<(String, usize), ParsePathError> {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        ensure!(
            chars[end] != ']' && chars[end] != '"',
            UnexpectedCharacterSnafu {
                character: chars[end],
                position: end
            }
        );
        end += 1;
    }

    ensure!(end > start, EmptySegmentSnafu { position: start });
    Ok((chars[start..end].iter().collect(), end))
}

fn parse_bracket(chars: &[char], start: usize) -> Result<(Segment, usize), ParsePathError> {
    let mut position = start + 1;
    let unterminated = UnterminatedBracketSnafu { position: start };

    match chars.get(position) {
        Some(']') => Ok((Segment::AnyIndex, position + 1)),
        Some('"') => {
            let mut key = String::new();
            position += 1;
            loop {
                match chars.get(position).context(unterminated)? {
                    '\\' => {
                        key.push(*chars.get(position + 1).context(unterminated)?);
                        position += 2;
                    }
                    '"' => break,
                    character => {
                        key.push(*character);
                        position += 1;
                    }
                }
            }
            ensure!(
                chars.get(position + 1) == Some(&']'),
                UnterminatedBracketSnafu { position: start }
            );
            Ok((Segment::Key(key), position + 2))
        }
        Some(_) => {
            let end = chars[position..]
                .iter()
                .position(|c| *c == ']')
                .map(|offset| position + offset)
                .context(unterminated)?;
            let index: String = chars[position..end].iter().collect();
            let parsed = index
                .parse::<usize>()
                .ok()
                .context(InvalidIndexSnafu { index })?;
            Ok((Segment::Index(parsed), end + 1))
        }
        None => unterminated.fail(),
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Key(key) if needs_quoting(key) => {
                    f.write_str("[\"")?;
                    for character in key.chars() {
                        if character == '"' || character == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{character}")?;
                    }
                    f.write_str("\"]")?;
                }
                Segment::Key(key) if position == 0 => f.write_str(key)?,
                Segment::Key(key) => write!(f, ".{key}")?,
                Segment::Index(index) => write!(f, "[{index}]")?,
                Segment::AnyIndex => f.write_str("[]")?,
            }
        }
        Ok(())
    }
}

fn needs_quoting(key: &str) -> bool {
    key.is_empty() || key.contains(['.', '[', ']', '"', '\\'])
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = String::deserialize(deserializer)?;
        input.parse().map_err(serde::de::Error::custom)
    }
}

/// Returns the value stored at `path`.
pub fn get<'a>(root: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |current, segment| match segment {
            Segment::Key(key) => current.as_object()?.get(key),
            Segment::Index(index) => current.as_array()?.get(*index),
            Segment::AnyIndex => None,
        })
}

/// Stores `value` at `path`, creating intermediate objects and arrays as
/// needed. An index may address an existing element or append exactly one.
pub fn set(root: &mut Value, path: &FieldPath, value: Value) -> Result<(), SetFieldError> {
    ensure!(!path.has_wildcard(), WildcardIndexSnafu { path: path.clone() });

    check_indices(root, path)?;

    let mut current = root;
    for (position, segment) in path.segments().iter().enumerate() {
        if current.is_null() {
            *current = match segment {
                Segment::Index(_) => Value::Array(Vec::new()),
                _ => Value::Object(Map::new()),
            };
        }

        let not_a_container = || NotAContainerSnafu {
            path: FieldPath(path.segments()[..position].to_vec()),
        };

        current = match segment {
            Segment::Key(key) => current
                .as_object_mut()
                .context(not_a_container())?
                .entry(key.clone())
                .or_insert(Value::Null),
            Segment::Index(index) => {
                let items = current.as_array_mut().context(not_a_container())?;
                if *index == items.len() {
                    items.push(Value::Null);
                }
                &mut items[*index]
            }
            Segment::AnyIndex => return WildcardIndexSnafu { path: path.clone() }.fail(),
        };
    }

    *current = value;
    Ok(())
}

// Rejects indices past the end of their array before anything is created, so a
// failed `set` leaves `root` untouched. Arrays created on the way are empty.
fn check_indices(root: &Value, path: &FieldPath) -> Result<(), SetFieldError> {
    let mut current = Some(root);
    for (position, segment) in path.segments().iter().enumerate() {
        let Segment::Index(index) = segment else {
            current = current.and_then(|value| match segment {
                Segment::Key(key) => value.as_object()?.get(key),
                _ => None,
            });
            continue;
        };

        let len = current.and_then(Value::as_array).map_or(0, Vec::len);
        ensure!(
            *index <= len,
            IndexOutOfRangeSnafu {
                path: FieldPath(path.segments()[..position].to_vec()),
                index: *index,
                len,
            }
        );
        current = current.and_then(|value| value.as_array()?.get(*index));
    }
    Ok(())
}

/// Removes and returns the value at `path`. Removing an array element shifts
/// the following elements.
pub fn remove(root: &mut Value, path: &FieldPath) -> Option<Value> {
    let (last, parents) = path.segments().split_last()?;
    let parent = parents
        .iter()
        .try_fold(root, |current, segment| match segment {
            Segment::Key(key) => current.as_object_mut()?.get_mut(key),
            Segment::Index(index) => current.as_array_mut()?.get_mut(*index),
            Segment::AnyIndex => None,
        })?;

    match last {
        Segment::Key(key) => parent.as_object_mut()?.shift_remove(key),
        Segment::Index(index) => {
            let items = parent.as_array_mut()?;
            (*index < items.len()).then(|| items.remove(*index))
        }
        Segment::AnyIndex => None,
    }
}

/// Returns every concrete path in `root` described by `pattern`.
pub fn expand(root: &Value, pattern: &FieldPath) -> Vec<FieldPath> {
    let mut found = Vec::new();
    expand_into(root, pattern.segments(), FieldPath::default(), &mut found);
    found
}

fn expand_into(current: &Value, rest: &[Segment], prefix: FieldPath, found: &mut Vec<FieldPath>) {
    let Some((segment, rest)) = rest.split_first() else {
        found.push(prefix);
        return;
    };

    match segment {
        Segment::Key(key) => {
            if let Some(next) = current.as_object().and_then(|object| object.get(key)) {
                expand_into(next, rest, prefix.child(key.clone()), found);
            }
        }
        Segment::Index(index) => {
            if let Some(next) = current.as_array().and_then(|items| items.get(*index)) {
                expand_into(next, rest, prefix.index(*index), found);
            }
        }
        Segment::AnyIndex => {
            for (index, next) in current.as_array().into_iter().flatten().enumerate() {
                expand_into(next, rest, prefix.index(index), found);
            }
        }
    }
}

/// Flattens the tree below `root` into an ordered map of leaf paths. Objects
/// and arrays are descended into; empty containers are kept as leaves.
pub fn flatten(root: &Value, prefix: &FieldPath) -> IndexMap<FieldPath, Value> {
    let mut leaves = IndexMap::new();
    flatten_into(root, prefix.clone(), &mut leaves);
    leaves
}

fn flatten_into(current: &Value, path: FieldPath, leaves: &mut IndexMap<FieldPath, Value>) {
    match current {
        Value::Object(object) if !object.is_empty() => {
            for (key, value) in object {
                flatten_into(value, path.child(key.clone()), leaves);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, value) in items.iter().enumerate() {
                flatten_into(value, path.index(index), leaves);
            }
        }
        leaf => {
            leaves.insert(path, leaf.clone());
        }
    }
}

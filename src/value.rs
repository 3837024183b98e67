//! The value and command model (§3, §4.4).
//!
//! A tagged sum of the handful of types the configuration language needs,
//! plus the substitution algorithm that resolves `$name` references and
//! `${name}` string interpolation against an environment.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::VarError;

/// The discriminant of a [`Value`], used for default-initializing a slot
/// of a known type (e.g. `set x <value>` infers nothing, but the `Option`
/// image tag's default value is typed ahead of time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Boolean,
    String,
    Reference,
    ValueList,
    CommandList,
}

/// A single configuration command: `name arg1 arg2 ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Value>,
}

/// An ordered sequence of [`Command`]s, the body of a `{ ... }` block.
pub type CommandList = Vec<Command>;

/// A configuration-language value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(u64),
    Boolean(bool),
    String(String),
    /// A deferred variable lookup, e.g. `$x`.
    Reference(String),
    ValueList(Vec<Value>),
    CommandList(CommandList),
}

/// Something that can be looked up by name during substitution. Both
/// [`crate::environ::Environment`] and plain test maps implement it.
pub trait VarLookup {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Value {
    #[must_use]
    pub fn default_for(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Integer => Value::Integer(0),
            ValueKind::Boolean => Value::Boolean(false),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Reference => Value::Reference(String::new()),
            ValueKind::ValueList => Value::ValueList(Vec::new()),
            ValueKind::CommandList => Value::CommandList(CommandList::new()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::String(_) => ValueKind::String,
            Value::Reference(_) => ValueKind::Reference,
            Value::ValueList(_) => ValueKind::ValueList,
            Value::CommandList(_) => ValueKind::CommandList,
        }
    }

    /// Destructively moves this value out, leaving an empty value of the
    /// same kind behind (§3: "destructive move (source emptied)").
    pub fn take(&mut self) -> Value {
        let empty = Value::default_for(self.kind());
        core::mem::replace(self, empty)
    }

    /// Turns a scalar value into its textual form for `${}` interpolation.
    /// Lists, command lists, and unresolved references cannot be
    /// stringified.
    #[must_use]
    pub fn stringify(&self) -> Option<String> {
        match self {
            Value::Integer(i) => Some(i.to_string()),
            Value::Boolean(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Reference(_) | Value::ValueList(_) | Value::CommandList(_) => None,
        }
    }

    /// Resolves this value against `env`: a bare [`Value::Reference`] is
    /// replaced by the looked-up value; a [`Value::String`] has every
    /// `${name}` splice resolved in place; a [`Value::ValueList`] is
    /// substituted recursively. Everything else is returned unchanged
    /// (property 2: substitution is the identity on reference-free
    /// values).
    ///
    /// # Errors
    ///
    /// [`VarError::VariableNotFound`] if a referenced name is absent from
    /// `env`; [`VarError::NotStringifiable`] if a `${name}` target cannot
    /// be turned into text. On error the original value passed in is
    /// logically unchanged (the caller substitutes into a clone; see
    /// `environ::exec::command_exec`).
    pub fn substitute<L: VarLookup + ?Sized>(&self, env: &L) -> Result<Value, VarError> {
        match self {
            Value::Reference(name) => env
                .lookup(name)
                .cloned()
                .ok_or(VarError::VariableNotFound),
            Value::String(s) => Ok(Value::String(substitute_string(s, env)?)),
            Value::ValueList(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.substitute(env)?);
                }
                Ok(Value::ValueList(out))
            }
            Value::Integer(_) | Value::Boolean(_) | Value::CommandList(_) => Ok(self.clone()),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// The `${name}` interpolation scan described in §4.4.
fn substitute_string<L: VarLookup + ?Sized>(input: &str, env: &L) -> Result<String, VarError> {
    let mut out = String::with_capacity(input.len());
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == '$' && bytes.get(i + 1) == Some(&'{') {
            let name_start = i + 2;
            let mut j = name_start;
            while j < bytes.len() && is_ident_char(bytes[j]) {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == '}' {
                let name: String = bytes[name_start..j].iter().collect();
                let value = env.lookup(&name).ok_or(VarError::VariableNotFound)?;
                let text = value.stringify().ok_or(VarError::NotStringifiable)?;
                out.push_str(&text);
                i = j + 1;
            } else {
                // No closing brace before EOF (or before a character that
                // can't appear in a name): the reference, and everything
                // after it, is silently dropped.
                break;
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    struct MapEnv(BTreeMap<String, Value>);
    impl VarLookup for MapEnv {
        fn lookup(&self, name: &str) -> Option<&Value> {
            self.0.get(name)
        }
    }

    fn env_with(pairs: &[(&str, Value)]) -> MapEnv {
        let mut m = BTreeMap::new();
        for (k, v) in pairs {
            m.insert((*k).to_string(), v.clone());
        }
        MapEnv(m)
    }

    #[test]
    fn substitute_is_identity_on_reference_free_values() {
        let env = env_with(&[]);
        let v = Value::Integer(42);
        assert_eq!(v.substitute(&env).unwrap(), v);
        let v = Value::ValueList(alloc::vec![Value::Boolean(true), Value::String("hi".into())]);
        assert_eq!(v.substitute(&env).unwrap(), v);
    }

    #[test]
    fn substitute_reference() {
        let env = env_with(&[("x", Value::Integer(42))]);
        let v = Value::Reference("x".into());
        assert_eq!(v.substitute(&env).unwrap(), Value::Integer(42));
    }

    #[test]
    fn substitute_reference_missing() {
        let env = env_with(&[]);
        let v = Value::Reference("missing".into());
        assert_eq!(v.substitute(&env), Err(VarError::VariableNotFound));
    }

    /// S1 from §8.
    #[test]
    fn scenario_s1_string_interpolation() {
        let env = env_with(&[("x", Value::Integer(42))]);
        let v = Value::String("hello ${x}".into());
        assert_eq!(
            v.substitute(&env).unwrap(),
            Value::String("hello 42".into())
        );
    }

    /// S4 from §8.
    #[test]
    fn scenario_s4_missing_variable_fails() {
        let env = env_with(&[]);
        let v = Value::String("${missing}".into());
        assert_eq!(v.substitute(&env), Err(VarError::VariableNotFound));
    }

    #[test]
    fn substitute_list_target_not_stringifiable() {
        let env = env_with(&[("x", Value::ValueList(alloc::vec![]))]);
        let v = Value::String("${x}".into());
        assert_eq!(v.substitute(&env), Err(VarError::NotStringifiable));
    }

    #[test]
    fn unclosed_reference_is_silently_dropped() {
        let env = env_with(&[]);
        let v = Value::String("abc${def".into());
        assert_eq!(v.substitute(&env).unwrap(), Value::String("abc".into()));
    }

    #[test]
    fn take_empties_source_of_same_kind() {
        let mut v = Value::String("hi".into());
        let taken = v.take();
        assert_eq!(taken, Value::String("hi".into()));
        assert_eq!(v, Value::String(String::new()));
    }
}

//! IR Type System
//!
//! Types attached to values. The lowering passes only need equality and a
//! join operation for merging values that flow out of different branches.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of an IR value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Bool,
    Int,
    Float,
    Str,
    /// The type of the `None` literal
    None,
    Tensor,
    /// A closure produced by a `Function` node
    Function,
    Optional(Box<Type>),
    List(Box<Type>),
    Tuple(Vec<Type>),
}

impl Type {
    pub fn optional(inner: Type) -> Self {
        Type::Optional(Box::new(inner))
    }

    pub fn list(elem: Type) -> Self {
        Type::List(Box::new(elem))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Bool)
    }
}

/// Join two types, if they have a common supertype.
///
/// Equal types join to themselves, `None` joins with `T` to `Optional[T]`,
/// optionals absorb compatible payloads and tuples join element-wise.
pub fn unify(a: &Type, b: &Type) -> Option<Type> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Type::None, Type::Optional(_)) => Some(b.clone()),
        (Type::Optional(_), Type::None) => Some(a.clone()),
        (Type::None, other) | (other, Type::None) => Some(Type::optional(other.clone())),
        (Type::Optional(x), Type::Optional(y)) => unify(x, y).map(Type::optional),
        (Type::Optional(x), other) | (other, Type::Optional(x)) => {
            unify(x, other).map(Type::optional)
        }
        (Type::Tuple(xs), Type::Tuple(ys)) if xs.len() == ys.len() => xs
            .iter()
            .zip(ys)
            .map(|(x, y)| unify(x, y))
            .collect::<Option<Vec<_>>>()
            .map(Type::Tuple),
        _ => None,
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "str"),
            Type::None => write!(f, "NoneType"),
            Type::Tensor => write!(f, "Tensor"),
            Type::Function => write!(f, "Function"),
            Type::Optional(inner) => write!(f, "Optional[{}]", inner),
            Type::List(elem) => write!(f, "List[{}]", elem),
            Type::Tuple(elems) => {
                write!(f, "Tuple[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", elem)?;
                }
                write!(f, "]")
            }
        }
    }
}

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::chunk::Chunk;

thread_local! {
    /// The string intern table. Grows monotonically over a program's lifetime.
    static INTERN: RefCell<FxHashSet<Rc<str>>> = RefCell::new(FxHashSet::default());
}

/// Interns `s`, returning the canonical copy for its content.
pub fn intern(s: &str) -> IStr {
    INTERN.with(|table| {
        let mut table = table.borrow_mut();
        if let Some(rc) = table.get(s) {
            return IStr(rc.clone());
        }
        let rc: Rc<str> = Rc::from(s);
        table.insert(rc.clone());
        IStr(rc)
    })
}

/// An interned, immutable string. Every `IStr` comes out of [`intern`], so
/// pointer identity implies content equality and comparison is one pointer
/// compare.
#[derive(Clone, Debug, Hash)]
pub struct IStr(Rc<str>);

impl IStr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for IStr {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for IStr {}

impl fmt::Display for IStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A runtime value. Primitives are unboxed; everything else is a shared
/// reference, so clones are cheap and aliases observe the same mutable state.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(f64),
    Str(IStr),
    Fun(Rc<Fun>),
    Closure(Rc<Closure>),
    Native(Rc<Native>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    BoundMethod(Rc<BoundMethod>),
}

impl Value {
    /// Only `nil` and `false` are falsey.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Rendering used by the `print` statement: like `Display`, except
    /// strings print their content bare instead of quoted.
    pub fn print_string(&self) -> String {
        match self {
            Value::Str(s) => s.as_str().to_string(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // IEEE semantics, so NaN != NaN.
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Fun(a), Value::Fun(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{:?}", s.as_str()),
            Value::Fun(fun) => write!(f, "{fun}"),
            Value::Closure(c) => write!(f, "{}", c.fun),
            Value::Native(n) => write!(f, "<native fn {}>", n.name),
            Value::Class(c) => write!(f, "<class {}>", c.name),
            Value::Instance(i) => write!(f, "<instanceof {}>", i.class.name),
            Value::BoundMethod(b) => write!(f, "{}", b.method.fun),
        }
    }
}

/// A compiled function prototype. Created only by the compiler and immutable
/// afterwards; the VM never runs one directly, only through a [`Closure`].
#[derive(Debug)]
pub struct Fun {
    /// `None` for the implicit top-level script.
    pub name: Option<IStr>,
    pub arity: usize,
    pub upval_count: usize,
    pub chunk: Chunk,
}

impl Fun {
    pub fn name(&self) -> &str {
        self.name.as_ref().map_or("<script>", IStr::as_str)
    }
}

impl fmt::Display for Fun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "<fn {name}>"),
            None => write!(f, "<script>"),
        }
    }
}

/// Storage for a variable captured by one or more closures: open while the
/// variable still lives on the VM stack, closed (owning the value) once its
/// slot is discarded. Shared through `Rc<RefCell<..>>` so every capturing
/// closure observes the same cell.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Closure {
    pub fun: Rc<Fun>,
    pub upvals: Vec<Rc<RefCell<Upvalue>>>,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct Native {
    pub name: &'static str,
    pub arity: usize,
    pub fun: NativeFn,
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

#[derive(Debug)]
pub struct Class {
    pub name: IStr,
    pub methods: RefCell<FxHashMap<IStr, Rc<Closure>>>,
}

impl Class {
    pub fn new(name: IStr) -> Self {
        Class { name, methods: RefCell::new(FxHashMap::default()) }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<FxHashMap<IStr, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Instance { class, fields: RefCell::new(FxHashMap::default()) }
    }
}

/// A closure bundled with the `this` receiver it was read off of.
#[derive(Debug)]
pub struct BoundMethod {
    pub recv: Value,
    pub method: Rc<Closure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_gives_identity_for_equal_content() {
        let a = intern("foo");
        let b = intern(&format!("fo{}", "o"));
        assert_eq!(a, b);
        assert_ne!(intern("foo"), intern("bar"));
    }

    #[test]
    fn truthiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Num(0.0).is_falsey());
        assert!(!Value::Str(intern("")).is_falsey());
    }

    #[test]
    fn equality_follows_ieee_for_numbers() {
        assert_eq!(Value::Num(2.0), Value::Num(2.0));
        assert_ne!(Value::Num(f64::NAN), Value::Num(f64::NAN));
    }

    #[test]
    fn cross_type_comparison_is_false_not_an_error() {
        assert_ne!(Value::Num(0.0), Value::Bool(false));
        assert_ne!(Value::Nil, Value::Bool(false));
        assert_ne!(Value::Str(intern("2")), Value::Num(2.0));
    }

    #[test]
    fn strings_compare_by_interned_identity() {
        assert_eq!(Value::Str(intern("abc")), Value::Str(intern("abc")));
        assert_ne!(Value::Str(intern("abc")), Value::Str(intern("abd")));
    }

    #[test]
    fn print_rendering_leaves_strings_bare() {
        assert_eq!(Value::Str(intern("hi")).print_string(), "hi");
        assert_eq!(Value::Num(4.0).print_string(), "4");
        assert_eq!(Value::Nil.print_string(), "nil");
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::Num(4.0).to_string(), "4");
        assert_eq!(Value::Num(11.4).to_string(), "11.4");
        assert_eq!(Value::Str(intern("hi")).to_string(), "\"hi\"");
        let class = Rc::new(Class::new(intern("Foo")));
        assert_eq!(Value::Class(class.clone()).to_string(), "<class Foo>");
        assert_eq!(
            Value::Instance(Rc::new(Instance::new(class))).to_string(),
            "<instanceof Foo>"
        );
    }
}

//! Function values: native (process-wide, address-identified) and
//! bytecode (per-VM closures with upvalues), matching the two sub-kinds
//! the copier must distinguish (spec.md §4.5.4).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::value::Value;
use crate::vm::Vm;
use lanes_error::Error;

/// Signature for a function implemented in the host language. Identity is
/// the address of the `&'static NativeFunction` that wraps it, which is
/// what the function lookup database (C2) keys on.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Vec<Value>, Error>;

pub struct NativeFunction {
    pub f: NativeFn,
    /// The `/`-joined path this function is registered under, if any. Native
    /// functions discovered only via closures without a stable root path
    /// have no name and cannot cross a keeper boundary (§4.5.4).
    pub default_name: Option<&'static str>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({:?})", self.default_name)
    }
}

/// A chunk produced by "dumping" a bytecode function: an opaque byte
/// sequence plus the chunk name the load site records (spec.md §4.5.4).
/// The instruction bytes themselves are never interpreted by the copier —
/// only the upvalue list and chunk name are inspected structurally, which
/// is all a value copier needs to care about.
#[derive(Clone)]
pub struct Chunk {
    pub name: String,
    pub code: Rc<[u8]>,
    pub upvalue_count: usize,
}

pub struct BytecodeFunction {
    pub chunk_name: String,
    pub code: Rc<[u8]>,
    /// Upvalues in declaration order. A function whose upvalue equals the
    /// defining VM's globals table is substituted for the destination's
    /// globals table on copy (§4.5.4), never copied structurally.
    pub upvalues: RefCell<Vec<Value>>,
}

impl BytecodeFunction {
    pub fn new(chunk_name: impl Into<String>, code: impl Into<Rc<[u8]>>, upvalues: Vec<Value>) -> Rc<Self> {
        Rc::new(Self {
            chunk_name: chunk_name.into(),
            code: code.into(),
            upvalues: RefCell::new(upvalues),
        })
    }

    pub fn dump(&self) -> Chunk {
        Chunk {
            name: self.chunk_name.clone(),
            code: Rc::clone(&self.code),
            upvalue_count: self.upvalues.borrow().len(),
        }
    }

    /// Loads a chunk on the destination side, producing a function with
    /// `upvalue_count` nil placeholders. The copier fills them in
    /// afterward, having already inserted this (still-partial) function
    /// into its copy cache to break upvalue cycles.
    pub fn load(chunk: &Chunk) -> Rc<Self> {
        Rc::new(Self {
            chunk_name: chunk.name.clone(),
            code: Rc::clone(&chunk.code),
            upvalues: RefCell::new(vec![Value::Nil; chunk.upvalue_count]),
        })
    }
}

#[derive(Clone)]
pub enum FunctionRef {
    Native(&'static NativeFunction),
    Bytecode(Rc<BytecodeFunction>),
}

impl FunctionRef {
    pub fn call(&self, vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, Error> {
        match self {
            FunctionRef::Native(nf) => (nf.f)(vm, args),
            FunctionRef::Bytecode(_) => {
                // This workspace does not execute bytecode (spec.md treats
                // the VM's execution loop as an external collaborator);
                // lane bodies built from bytecode are driven by the
                // embedding host. Calling one directly is a programmer
                // error in this harness.
                Err(Error::other("bytecode functions are not directly callable in this harness"))
            }
        }
    }
}

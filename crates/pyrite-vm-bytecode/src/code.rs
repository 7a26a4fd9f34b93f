//! Code units
//!
//! A [`CodeUnit`] is the immutable compiled form of one module body or
//! function body. Instructions and per-instruction metadata are
//! parallel arrays of the same length.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::constant::Constant;
use crate::error::BytecodeError;
use crate::function::FuncDecl;
use crate::instruction::{Instr, Op};

/// Sentinel block index for instructions outside any structured block.
pub const NO_BLOCK: u16 = u16::MAX;

/// Kind of a structured block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// A loop body; its per-block runtime state is the iterator
    Loop,
    /// A context-manager body; its runtime state is the entered resource
    With,
    /// A try body; exceptions raised inside transfer to `handler`
    TryExcept,
}

/// One structured block with its bytecode extent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Block {
    /// The block kind
    pub kind: BlockKind,
    /// Enclosing block, or `NO_BLOCK` at top level
    pub parent: u16,
    /// First instruction offset of the block body
    pub start: u32,
    /// Offset just past the block (break target for loops)
    pub end: u32,
    /// Handler offset for `TryExcept` blocks (unused otherwise)
    pub handler: u32,
}

/// Per-instruction metadata, parallel to the instruction array.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrMeta {
    /// Source line number (1-indexed; 0 when unknown)
    pub line: u32,
    /// True for compiler-synthesized instructions with no direct
    /// source counterpart
    pub synthetic: bool,
    /// Index of the innermost enclosing block, or `NO_BLOCK`
    pub block: u16,
}

/// A named jump target for explicit gotos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Absolute instruction offset
    pub target: u32,
}

/// An immutable compiled unit.
#[derive(Debug, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Unit name (module name or function name)
    pub name: String,
    /// Source path for tracebacks
    pub source: String,
    /// Instruction array
    pub instrs: Vec<Instr>,
    /// Metadata array, same length as `instrs`
    pub meta: Vec<InstrMeta>,
    /// Constants table
    pub consts: Vec<Constant>,
    /// Local-variable names; `names.len()` is the local slot count
    pub names: Vec<String>,
    /// Structured-block table
    pub blocks: Vec<Block>,
    /// Label table
    pub labels: Vec<Label>,
    /// Nested function declarations
    pub funcs: Vec<FuncDecl>,
}

impl CodeUnit {
    /// Start building a unit.
    pub fn builder(name: impl Into<String>, source: impl Into<String>) -> CodeUnitBuilder {
        CodeUnitBuilder::new(name, source)
    }

    /// Number of local slots the frame must reserve.
    #[inline]
    pub fn local_count(&self) -> usize {
        self.names.len()
    }

    /// Source line for the instruction at `offset` (0 when unknown).
    pub fn line_of(&self, offset: usize) -> u32 {
        self.meta.get(offset).map(|m| m.line).unwrap_or(0)
    }

    /// The block enclosing the instruction at `offset`.
    pub fn block_of(&self, offset: usize) -> Option<&Block> {
        let idx = self.meta.get(offset)?.block;
        self.block(idx)
    }

    /// Look up a block by index (`NO_BLOCK` yields `None`).
    pub fn block(&self, idx: u16) -> Option<&Block> {
        if idx == NO_BLOCK {
            return None;
        }
        self.blocks.get(idx as usize)
    }

    /// Resolve a label by name.
    pub fn label(&self, name: &str) -> Option<u32> {
        self.labels.iter().find(|l| l.name == name).map(|l| l.target)
    }

    /// Look up a constant, reporting a structured error when out of
    /// range (used by host-facing inspection paths; the dispatch loop
    /// indexes directly).
    pub fn constant(&self, idx: u16) -> Result<&Constant, BytecodeError> {
        self.consts
            .get(idx as usize)
            .ok_or(BytecodeError::IndexOutOfRange {
                table: "constants",
                index: idx as usize,
                len: self.consts.len(),
            })
    }
}

/// Mutable builder for [`CodeUnit`] values.
///
/// Hosts and tests use this to assemble units by hand; a compiler
/// front end drives the same API.
#[derive(Debug)]
pub struct CodeUnitBuilder {
    name: String,
    source: String,
    instrs: Vec<Instr>,
    meta: Vec<InstrMeta>,
    consts: Vec<Constant>,
    names: Vec<String>,
    name_slots: FxHashMap<String, u16>,
    blocks: Vec<Block>,
    labels: Vec<Label>,
    funcs: Vec<FuncDecl>,
    current_line: u32,
    current_block: u16,
}

impl CodeUnitBuilder {
    /// Create a builder for a unit with the given name and source path.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            instrs: Vec::new(),
            meta: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            name_slots: FxHashMap::default(),
            blocks: Vec::new(),
            labels: Vec::new(),
            funcs: Vec::new(),
            current_line: 0,
            current_block: NO_BLOCK,
        }
    }

    /// Set the source line attributed to subsequent instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// Set the enclosing block attributed to subsequent instructions.
    pub fn in_block(&mut self, block: u16) -> &mut Self {
        self.current_block = block;
        self
    }

    /// Append an instruction; returns its offset.
    pub fn emit(&mut self, op: Op, arg: u16) -> u32 {
        let offset = self.instrs.len() as u32;
        self.instrs.push(Instr::new(op, arg));
        self.meta.push(InstrMeta {
            line: self.current_line,
            synthetic: false,
            block: self.current_block,
        });
        offset
    }

    /// Append a compiler-synthesized instruction; returns its offset.
    pub fn emit_synthetic(&mut self, op: Op, arg: u16) -> u32 {
        let offset = self.emit(op, arg);
        self.meta[offset as usize].synthetic = true;
        offset
    }

    /// Current instruction offset (the target of the next `emit`).
    pub fn here(&self) -> u32 {
        self.instrs.len() as u32
    }

    /// Patch the operand of a previously emitted instruction.
    pub fn patch(&mut self, offset: u32, arg: u16) {
        self.instrs[offset as usize].arg = arg;
    }

    /// Intern a constant; returns its index.
    pub fn add_const(&mut self, c: Constant) -> u16 {
        if let Some(idx) = self.consts.iter().position(|x| x == &c) {
            return idx as u16;
        }
        self.consts.push(c);
        (self.consts.len() - 1) as u16
    }

    /// Register a local name; returns its slot index. Repeated names
    /// return the existing slot.
    pub fn add_name(&mut self, name: impl Into<String>) -> u16 {
        let name = name.into();
        if let Some(&idx) = self.name_slots.get(&name) {
            return idx;
        }
        let idx = self.names.len() as u16;
        self.names.push(name.clone());
        self.name_slots.insert(name, idx);
        idx
    }

    /// Register a structured block; returns its index. Extents may be
    /// patched later via [`CodeUnitBuilder::patch_block`].
    pub fn add_block(&mut self, kind: BlockKind, parent: u16) -> u16 {
        self.blocks.push(Block {
            kind,
            parent,
            start: 0,
            end: 0,
            handler: 0,
        });
        (self.blocks.len() - 1) as u16
    }

    /// Set a block's extent and handler offsets.
    pub fn patch_block(&mut self, idx: u16, start: u32, end: u32, handler: u32) {
        let block = &mut self.blocks[idx as usize];
        block.start = start;
        block.end = end;
        block.handler = handler;
    }

    /// Add a named label at `target`.
    pub fn add_label(&mut self, name: impl Into<String>, target: u32) {
        self.labels.push(Label {
            name: name.into(),
            target,
        });
    }

    /// Register a nested function declaration; returns its index.
    pub fn add_func(&mut self, func: FuncDecl) -> u16 {
        self.funcs.push(func);
        (self.funcs.len() - 1) as u16
    }

    /// Finish the unit.
    pub fn build(&mut self) -> CodeUnit {
        self.name_slots.clear();
        CodeUnit {
            name: std::mem::take(&mut self.name),
            source: std::mem::take(&mut self.source),
            instrs: std::mem::take(&mut self.instrs),
            meta: std::mem::take(&mut self.meta),
            consts: std::mem::take(&mut self.consts),
            names: std::mem::take(&mut self.names),
            blocks: std::mem::take(&mut self.blocks),
            labels: std::mem::take(&mut self.labels),
            funcs: std::mem::take(&mut self.funcs),
        }
    }
}

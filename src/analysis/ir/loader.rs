//! Load a `Module` from its JSON description.
//!
//! Operands are written as `%N` (parameter N), `@Name` (a global),
//! an integer literal, or the `id` of an instruction in the same function.
//! Types are written as `void`, `iN`, `*T`, or the name of a declared type.
//! Callees that are not defined in `functions` are declared on first use.
use std::error::Error;
use std::fs;
use std::path::Path;

use log::debug;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use super::{BlockId, DebugLoc, FunctionId, InstId, InstKind, IntPredicate, Module, ModuleBuilder, TypeId, ValueRef};

#[derive(Debug, Deserialize)]
struct ModuleDesc {
    #[serde(default)]
    types: Vec<TypeDesc>,
    #[serde(default)]
    globals: Vec<GlobalDesc>,
    #[serde(default)]
    functions: Vec<FunctionDesc>,
}

#[derive(Debug, Deserialize)]
struct TypeDesc {
    name: String,
    /// `None` declares an opaque type.
    #[serde(default)]
    fields: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GlobalDesc {
    name: String,
    ty: String,
}

#[derive(Debug, Deserialize)]
struct FunctionDesc {
    name: String,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default = "void_name")]
    ret: String,
    #[serde(default)]
    blocks: Vec<BlockDesc>,
}

fn void_name() -> String {
    "void".to_owned()
}

#[derive(Debug, Deserialize)]
struct BlockDesc {
    label: String,
    #[serde(default)]
    insts: Vec<InstDesc>,
}

#[derive(Debug, Deserialize)]
struct InstDesc {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    ty: Option<String>,
    #[serde(default)]
    loc: Option<LocDesc>,
    #[serde(flatten)]
    op: OpDesc,
}

#[derive(Debug, Deserialize)]
struct LocDesc {
    #[serde(default)]
    directory: String,
    file: String,
    line: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Operand {
    Int(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum OpDesc {
    Call {
        callee: String,
        #[serde(default)]
        args: Vec<Operand>,
    },
    CallIndirect {
        callee: Operand,
        #[serde(default)]
        args: Vec<Operand>,
    },
    Invoke {
        callee: String,
        #[serde(default)]
        args: Vec<Operand>,
        normal: String,
        unwind: String,
    },
    Br {
        dest: String,
    },
    CondBr {
        cond: Operand,
        then_dest: String,
        else_dest: String,
    },
    Ret {
        #[serde(default)]
        value: Option<Operand>,
    },
    Unreachable,
    Load {
        ptr: Operand,
    },
    Store {
        value: Operand,
        ptr: Operand,
    },
    Field {
        base: Operand,
        indices: Vec<i64>,
    },
    Cast {
        value: Operand,
    },
    Icmp {
        #[serde(default)]
        pred: Option<String>,
        lhs: Operand,
        rhs: Operand,
    },
    Alloca {
        allocated: String,
    },
    Phi {
        incoming: Vec<(Operand, String)>,
    },
    Dbg {
        #[serde(default)]
        operands: Vec<Operand>,
    },
    LandingPad,
    Other {
        #[serde(default)]
        operands: Vec<Operand>,
    },
}

pub fn load_module(path: &Path) -> Result<Module, Box<dyn Error>> {
    let content = fs::read_to_string(path)?;
    parse_module(&content)
}

pub fn parse_module(content: &str) -> Result<Module, Box<dyn Error>> {
    let desc: ModuleDesc = serde_json::from_str(content)?;
    let mut loader = Loader::default();
    loader.load(desc)?;
    Ok(loader.builder.finish())
}

#[derive(Default)]
struct Loader {
    builder: ModuleBuilder,
    functions: FxHashMap<String, FunctionId>,
    globals: FxHashMap<String, ValueRef>,
}

/// Name resolution state for the function being built.
struct FnScope {
    func: FunctionId,
    blocks: FxHashMap<String, BlockId>,
    insts: FxHashMap<String, InstId>,
}

impl Loader {
    fn load(&mut self, desc: ModuleDesc) -> Result<(), Box<dyn Error>> {
        // Names first, so that fields may refer to any declared type.
        let mut structs = Vec::new();
        for ty in &desc.types {
            if self.builder.lookup_named(&ty.name).is_some() {
                return Err(format!("type `{}` is defined twice", ty.name).into());
            }
            match &ty.fields {
                Some(fields) => structs.push((self.builder.declare_struct(&ty.name), fields)),
                None => {
                    self.builder.opaque(&ty.name);
                }
            }
        }
        for (id, fields) in structs {
            let fields = fields
                .iter()
                .map(|f| self.parse_type(f))
                .collect::<Result<Vec<_>, _>>()?;
            self.builder.set_struct_fields(id, &fields);
        }
        for global in &desc.globals {
            let ty = self.parse_type(&global.ty)?;
            let value = self.builder.global(&global.name, ty);
            self.globals.insert(global.name.clone(), value);
        }
        for func in &desc.functions {
            if self.functions.contains_key(&func.name) {
                return Err(format!("function `{}` is defined twice", func.name).into());
            }
            let params = func
                .params
                .iter()
                .map(|p| self.parse_type(p))
                .collect::<Result<Vec<_>, _>>()?;
            let ret = self.parse_type(&func.ret)?;
            let id = self.builder.function(&func.name, &params, ret);
            self.functions.insert(func.name.clone(), id);
        }
        for func in &desc.functions {
            self.load_body(func)?;
        }
        Ok(())
    }

    fn load_body(&mut self, desc: &FunctionDesc) -> Result<(), Box<dyn Error>> {
        let func = self.functions[&desc.name];
        let mut scope = FnScope {
            func,
            blocks: FxHashMap::default(),
            insts: FxHashMap::default(),
        };
        for block in &desc.blocks {
            let bb = self.builder.block(func, &block.label);
            if scope.blocks.insert(block.label.clone(), bb).is_some() {
                return Err(format!("block `{}` is defined twice in `{}`", block.label, desc.name).into());
            }
        }
        // Instructions are numbered in push order, so ids can be handed out
        // before any instruction exists; this lets phis refer forward.
        let mut next = self.builder.num_insts();
        for block in &desc.blocks {
            for inst in &block.insts {
                if let Some(id) = &inst.id {
                    if scope.insts.insert(id.clone(), InstId(next)).is_some() {
                        return Err(format!("instruction `{}` is defined twice in `{}`", id, desc.name).into());
                    }
                }
                next += 1;
            }
        }
        for block in &desc.blocks {
            let bb = scope.blocks[&block.label];
            for inst in &block.insts {
                let (kind, default_ty) = self.lower(inst, &scope)?;
                let ty = match &inst.ty {
                    Some(ty) => self.parse_type(ty)?,
                    None => default_ty,
                };
                let id = self.builder.push(bb, kind, ty);
                if let Some(loc) = &inst.loc {
                    self.builder.set_loc(
                        id,
                        DebugLoc::new(loc.directory.clone(), loc.file.clone(), loc.line),
                    );
                }
            }
        }
        debug!("loaded {} ({} blocks)", desc.name, desc.blocks.len());
        Ok(())
    }

    fn lower(&mut self, inst: &InstDesc, scope: &FnScope) -> Result<(InstKind, TypeId), Box<dyn Error>> {
        let void = self.builder.void();
        let lowered = match &inst.op {
            OpDesc::Call { callee, args } => {
                let f = self.callee(callee, inst.ty.as_deref())?;
                let ret = self.builder.return_type(f);
                (
                    InstKind::Call {
                        callee: super::Callee::Direct(f),
                        args: self.operands(args, scope)?,
                    },
                    ret,
                )
            }
            OpDesc::CallIndirect { callee, args } => (
                InstKind::Call {
                    callee: super::Callee::Indirect(self.operand(callee, scope)?),
                    args: self.operands(args, scope)?,
                },
                void,
            ),
            OpDesc::Invoke {
                callee,
                args,
                normal,
                unwind,
            } => {
                let f = self.callee(callee, inst.ty.as_deref())?;
                let ret = self.builder.return_type(f);
                (
                    InstKind::Invoke {
                        callee: super::Callee::Direct(f),
                        args: self.operands(args, scope)?,
                        normal: block_ref(normal, scope)?,
                        unwind: block_ref(unwind, scope)?,
                    },
                    ret,
                )
            }
            OpDesc::Br { dest } => (
                InstKind::Br {
                    dest: block_ref(dest, scope)?,
                },
                void,
            ),
            OpDesc::CondBr {
                cond,
                then_dest,
                else_dest,
            } => (
                InstKind::CondBr {
                    cond: self.operand(cond, scope)?,
                    then_dest: block_ref(then_dest, scope)?,
                    else_dest: block_ref(else_dest, scope)?,
                },
                void,
            ),
            OpDesc::Ret { value } => {
                let value = match value {
                    Some(v) => Some(self.operand(v, scope)?),
                    None => None,
                };
                (InstKind::Ret { value }, void)
            }
            OpDesc::Unreachable => (InstKind::Unreachable, void),
            OpDesc::Load { ptr } => {
                let ptr = self.operand(ptr, scope)?;
                (InstKind::Load { ptr }, void)
            }
            OpDesc::Store { value, ptr } => (
                InstKind::Store {
                    value: self.operand(value, scope)?,
                    ptr: self.operand(ptr, scope)?,
                },
                void,
            ),
            OpDesc::Field { base, indices } => (
                InstKind::FieldAddr {
                    base: self.operand(base, scope)?,
                    indices: indices.clone(),
                },
                void,
            ),
            OpDesc::Cast { value } => (
                InstKind::Cast {
                    value: self.operand(value, scope)?,
                },
                void,
            ),
            OpDesc::Icmp { pred, lhs, rhs } => {
                let pred = match pred.as_deref() {
                    Some("eq") | None => IntPredicate::Eq,
                    Some("ne") => IntPredicate::Ne,
                    Some(_) => IntPredicate::Other,
                };
                let i1 = self.builder.int(1);
                (
                    InstKind::ICmp {
                        pred,
                        lhs: self.operand(lhs, scope)?,
                        rhs: self.operand(rhs, scope)?,
                    },
                    i1,
                )
            }
            OpDesc::Alloca { allocated } => {
                let allocated = self.parse_type(allocated)?;
                (InstKind::Alloca, self.builder.pointer(allocated))
            }
            OpDesc::Phi { incoming } => {
                let incoming = incoming
                    .iter()
                    .map(|(v, bb)| Ok((self.operand(v, scope)?, block_ref(bb, scope)?)))
                    .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
                (InstKind::Phi { incoming }, void)
            }
            OpDesc::Dbg { operands } => (
                InstKind::DebugIntrinsic {
                    operands: self.operands(operands, scope)?,
                },
                void,
            ),
            OpDesc::LandingPad => (InstKind::LandingPad, void),
            OpDesc::Other { operands } => (
                InstKind::Other {
                    operands: self.operands(operands, scope)?,
                },
                void,
            ),
        };
        Ok(lowered)
    }

    /// Resolve a callee by name, declaring unknown ones on the fly with the
    /// call's result type as their return type.
    fn callee(&mut self, name: &str, ty: Option<&str>) -> Result<FunctionId, Box<dyn Error>> {
        if let Some(f) = self.functions.get(name) {
            return Ok(*f);
        }
        let ret = match ty {
            Some(ty) => self.parse_type(ty)?,
            None => self.builder.void(),
        };
        let f = self.builder.function(name, &[], ret);
        self.functions.insert(name.to_owned(), f);
        Ok(f)
    }

    fn operands(&self, ops: &[Operand], scope: &FnScope) -> Result<Vec<ValueRef>, Box<dyn Error>> {
        ops.iter().map(|op| self.operand(op, scope)).collect()
    }

    fn operand(&self, op: &Operand, scope: &FnScope) -> Result<ValueRef, Box<dyn Error>> {
        match op {
            Operand::Int(v) => Ok(ValueRef::ConstInt(*v)),
            Operand::Name(name) => {
                if let Some(index) = name.strip_prefix('%') {
                    let index: u32 = index.parse()?;
                    Ok(self.builder.arg(scope.func, index))
                } else if let Some(global) = name.strip_prefix('@') {
                    self.globals
                        .get(global)
                        .copied()
                        .ok_or_else(|| format!("unknown global `{}`", global).into())
                } else {
                    scope
                        .insts
                        .get(name)
                        .map(|id| ValueRef::Inst(*id))
                        .ok_or_else(|| format!("unknown value `{}`", name).into())
                }
            }
        }
    }

    fn parse_type(&mut self, s: &str) -> Result<TypeId, Box<dyn Error>> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix('*') {
            let inner = self.parse_type(inner)?;
            return Ok(self.builder.pointer(inner));
        }
        if s == "void" {
            return Ok(self.builder.void());
        }
        if let Some(bits) = s.strip_prefix('i') {
            if let Ok(bits) = bits.parse::<u32>() {
                return Ok(self.builder.int(bits));
            }
        }
        self.builder
            .lookup_named(s)
            .ok_or_else(|| format!("unknown type `{}`", s).into())
    }
}

fn block_ref(label: &str, scope: &FnScope) -> Result<BlockId, Box<dyn Error>> {
    scope
        .blocks
        .get(label)
        .copied()
        .ok_or_else(|| format!("unknown block `{}`", label).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ir::TypeKind;

    const MODULE: &str = r#"{
        "types": [
            { "name": "Mutex" },
            { "name": "Foo", "fields": ["i32", "Mutex"] }
        ],
        "functions": [
            { "name": "foo", "params": ["*Foo"],
              "blocks": [
                { "label": "start", "insts": [
                    { "id": "m", "op": "field", "base": "%0", "indices": [0, 1], "ty": "*Mutex" },
                    { "id": "g", "op": "call", "callee": "std::sync::mutex::Mutex<T>::lock",
                      "args": ["m"], "ty": "*i8",
                      "loc": { "directory": "/src", "file": "lib.rs", "line": 7 } },
                    { "op": "br", "dest": "exit" }
                ]},
                { "label": "exit", "insts": [ { "op": "ret" } ] }
              ]}
        ]
    }"#;

    #[test]
    fn test_parse_module_ok() {
        let m = parse_module(MODULE).unwrap();
        let foo = m.function_by_name("foo").unwrap();
        let lock = m
            .function_by_name("std::sync::mutex::Mutex<T>::lock")
            .unwrap();
        assert!(m.function(lock).is_declaration());
        assert!(!m.function(foo).is_declaration());
        let insts: Vec<_> = m.insts_of(foo).collect();
        assert_eq!(insts.len(), 4);
        assert_eq!(m.called_function(insts[1]), Some(lock));
        assert_eq!(m.call_args(insts[1]).unwrap(), &[ValueRef::Inst(insts[0])]);
        assert_eq!(m.loc_of(insts[1]).unwrap().line, 7);
        let mutex_ptr = m.value_type(ValueRef::Inst(insts[0]));
        let mutex = m.pointee(mutex_ptr).unwrap();
        assert!(matches!(m.ty(mutex), TypeKind::Opaque(name) if name == "Mutex"));
    }

    #[test]
    fn test_parse_module_unknown_value() {
        let bad = MODULE.replace(r#""args": ["m"]"#, r#""args": ["nope"]"#);
        assert!(parse_module(&bad).is_err());
    }

    fn struct_fields<'m>(m: &'m Module, name: &str) -> (TypeId, &'m [TypeId]) {
        m.types
            .iter()
            .enumerate()
            .find_map(|(idx, kind)| match kind {
                TypeKind::Struct { name: n, fields } if n == name => {
                    Some((TypeId(idx as u32), fields.as_slice()))
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_parse_module_recursive_types() {
        let m = parse_module(
            r#"{
            "types": [
                { "name": "Outer", "fields": ["*Inner", "Node"] },
                { "name": "Node", "fields": ["*Node", "i32"] },
                { "name": "Inner", "fields": ["Mutex"] },
                { "name": "Mutex" }
            ]
        }"#,
        )
        .unwrap();
        let (node, node_fields) = struct_fields(&m, "Node");
        assert_eq!(m.pointee(node_fields[0]), Some(node));
        let (inner, inner_fields) = struct_fields(&m, "Inner");
        assert!(matches!(m.ty(inner_fields[0]), TypeKind::Opaque(name) if name == "Mutex"));
        let (_, outer_fields) = struct_fields(&m, "Outer");
        assert_eq!(outer_fields.len(), 2);
        assert_eq!(m.pointee(outer_fields[0]), Some(inner));
        assert_eq!(outer_fields[1], node);
    }

    #[test]
    fn test_parse_module_duplicate_names() {
        let twice = MODULE.replace(
            r#"{ "name": "Mutex" },"#,
            r#"{ "name": "Mutex" }, { "name": "Mutex" },"#,
        );
        assert!(parse_module(&twice).is_err());
        let shadowed = MODULE.replace(r#""id": "g""#, r#""id": "m""#);
        assert!(parse_module(&shadowed).is_err());
    }

    #[test]
    fn test_parse_module_unknown_type() {
        let bad = MODULE.replace(r#""ty": "*Mutex""#, r#""ty": "*Nope""#);
        assert!(parse_module(&bad).is_err());
    }
}

//! Incremental construction of a `Module`.
use rustc_hash::FxHashMap;

use super::{
    Block, BlockId, Callee, DebugLoc, Function, FunctionId, Global, GlobalId, InstId, InstKind,
    Instruction, IntPredicate, Module, TypeId, TypeKind, ValueRef,
};

pub struct ModuleBuilder {
    module: Module,
    interned: FxHashMap<TypeKind, TypeId>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            module: Module::default(),
            interned: FxHashMap::default(),
        };
        builder.module.void_ty = builder.intern(TypeKind::Void);
        builder.module.int_ty = builder.intern(TypeKind::Int(64));
        builder
    }

    fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.interned.get(&kind) {
            return *id;
        }
        let id = TypeId(self.module.types.len() as u32);
        self.module.types.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    pub fn void(&mut self) -> TypeId {
        self.module.void_ty
    }

    pub fn int(&mut self, bits: u32) -> TypeId {
        self.intern(TypeKind::Int(bits))
    }

    pub fn pointer(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer(pointee))
    }

    pub fn struct_type(&mut self, name: &str, fields: &[TypeId]) -> TypeId {
        self.intern(TypeKind::Struct {
            name: name.to_owned(),
            fields: fields.to_vec(),
        })
    }

    /// A named struct whose fields are filled in later by `set_struct_fields`,
    /// so that fields may refer to the struct itself or to later types.
    pub fn declare_struct(&mut self, name: &str) -> TypeId {
        let id = TypeId(self.module.types.len() as u32);
        self.module.types.push(TypeKind::Struct {
            name: name.to_owned(),
            fields: Vec::new(),
        });
        id
    }

    pub fn set_struct_fields(&mut self, ty: TypeId, new_fields: &[TypeId]) {
        if let TypeKind::Struct { fields, .. } = &mut self.module.types[ty.index()] {
            *fields = new_fields.to_vec();
        }
    }

    pub fn opaque(&mut self, name: &str) -> TypeId {
        self.intern(TypeKind::Opaque(name.to_owned()))
    }

    pub fn lookup_named(&self, name: &str) -> Option<TypeId> {
        self.module
            .types
            .iter()
            .position(|kind| {
                matches!(kind, TypeKind::Struct { name: n, .. } | TypeKind::Opaque(n) if n == name)
            })
            .map(|idx| TypeId(idx as u32))
    }

    pub fn global(&mut self, name: &str, ty: TypeId) -> ValueRef {
        let ptr_ty = self.pointer(ty);
        let id = GlobalId(self.module.globals.len() as u32);
        self.module.globals.push(Global {
            name: name.to_owned(),
            ty,
            ptr_ty,
        });
        ValueRef::Global(id)
    }

    /// Adds a function; it stays a declaration until a block is added.
    pub fn function(&mut self, name: &str, params: &[TypeId], ret: TypeId) -> FunctionId {
        let id = FunctionId(self.module.functions.len() as u32);
        self.module.functions.push(Function {
            name: name.to_owned(),
            params: params.to_vec(),
            ret,
            blocks: Vec::new(),
        });
        id
    }

    pub fn return_type(&self, func: FunctionId) -> TypeId {
        self.module.functions[func.index()].ret
    }

    pub fn num_insts(&self) -> u32 {
        self.module.insts.len() as u32
    }

    pub fn arg(&self, func: FunctionId, index: u32) -> ValueRef {
        ValueRef::Arg { func, index }
    }

    pub fn block(&mut self, func: FunctionId, label: &str) -> BlockId {
        let id = BlockId(self.module.blocks.len() as u32);
        self.module.blocks.push(Block {
            label: label.to_owned(),
            func,
            insts: Vec::new(),
        });
        self.module.functions[func.index()].blocks.push(id);
        id
    }

    pub fn push(&mut self, bb: BlockId, kind: InstKind, ty: TypeId) -> InstId {
        let id = InstId(self.module.insts.len() as u32);
        self.module.insts.push(Instruction {
            kind,
            ty,
            block: bb,
            loc: None,
        });
        self.module.blocks[bb.index()].insts.push(id);
        id
    }

    pub fn set_loc(&mut self, inst: InstId, loc: DebugLoc) {
        self.module.insts[inst.index()].loc = Some(loc);
    }

    /// Attach a debug location and hand the instruction back.
    pub fn at(&mut self, inst: InstId, file: &str, line: u32) -> InstId {
        self.set_loc(inst, DebugLoc::new("/src", file, line));
        inst
    }

    pub fn call(&mut self, bb: BlockId, callee: FunctionId, args: &[ValueRef]) -> InstId {
        let ty = self.module.functions[callee.index()].ret;
        self.push(
            bb,
            InstKind::Call {
                callee: Callee::Direct(callee),
                args: args.to_vec(),
            },
            ty,
        )
    }

    pub fn call_indirect(
        &mut self,
        bb: BlockId,
        callee: ValueRef,
        args: &[ValueRef],
        ret: TypeId,
    ) -> InstId {
        self.push(
            bb,
            InstKind::Call {
                callee: Callee::Indirect(callee),
                args: args.to_vec(),
            },
            ret,
        )
    }

    pub fn invoke(
        &mut self,
        bb: BlockId,
        callee: FunctionId,
        args: &[ValueRef],
        normal: BlockId,
        unwind: BlockId,
    ) -> InstId {
        let ty = self.module.functions[callee.index()].ret;
        self.push(
            bb,
            InstKind::Invoke {
                callee: Callee::Direct(callee),
                args: args.to_vec(),
                normal,
                unwind,
            },
            ty,
        )
    }

    pub fn br(&mut self, bb: BlockId, dest: BlockId) -> InstId {
        let void = self.void();
        self.push(bb, InstKind::Br { dest }, void)
    }

    pub fn cond_br(
        &mut self,
        bb: BlockId,
        cond: ValueRef,
        then_dest: BlockId,
        else_dest: BlockId,
    ) -> InstId {
        let void = self.void();
        self.push(
            bb,
            InstKind::CondBr {
                cond,
                then_dest,
                else_dest,
            },
            void,
        )
    }

    pub fn ret(&mut self, bb: BlockId) -> InstId {
        let void = self.void();
        self.push(bb, InstKind::Ret { value: None }, void)
    }

    pub fn unreachable(&mut self, bb: BlockId) -> InstId {
        let void = self.void();
        self.push(bb, InstKind::Unreachable, void)
    }

    pub fn load(&mut self, bb: BlockId, ptr: ValueRef, ty: TypeId) -> InstId {
        self.push(bb, InstKind::Load { ptr }, ty)
    }

    pub fn store(&mut self, bb: BlockId, value: ValueRef, ptr: ValueRef) -> InstId {
        let void = self.void();
        self.push(bb, InstKind::Store { value, ptr }, void)
    }

    pub fn field_addr(
        &mut self,
        bb: BlockId,
        base: ValueRef,
        indices: &[i64],
        ty: TypeId,
    ) -> InstId {
        self.push(
            bb,
            InstKind::FieldAddr {
                base,
                indices: indices.to_vec(),
            },
            ty,
        )
    }

    pub fn cast(&mut self, bb: BlockId, value: ValueRef, ty: TypeId) -> InstId {
        self.push(bb, InstKind::Cast { value }, ty)
    }

    pub fn icmp(
        &mut self,
        bb: BlockId,
        pred: IntPredicate,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstId {
        let i1 = self.int(1);
        self.push(bb, InstKind::ICmp { pred, lhs, rhs }, i1)
    }

    /// Stack slot of type `ty`; the instruction itself is a pointer to it.
    pub fn alloca(&mut self, bb: BlockId, ty: TypeId) -> InstId {
        let ptr = self.pointer(ty);
        self.push(bb, InstKind::Alloca, ptr)
    }

    pub fn phi(&mut self, bb: BlockId, incoming: &[(ValueRef, BlockId)], ty: TypeId) -> InstId {
        self.push(
            bb,
            InstKind::Phi {
                incoming: incoming.to_vec(),
            },
            ty,
        )
    }

    pub fn debug_intrinsic(&mut self, bb: BlockId, operands: &[ValueRef]) -> InstId {
        let void = self.void();
        self.push(
            bb,
            InstKind::DebugIntrinsic {
                operands: operands.to_vec(),
            },
            void,
        )
    }

    pub fn landing_pad(&mut self, bb: BlockId) -> InstId {
        let void = self.void();
        self.push(bb, InstKind::LandingPad, void)
    }

    pub fn other(&mut self, bb: BlockId, operands: &[ValueRef], ty: TypeId) -> InstId {
        self.push(
            bb,
            InstKind::Other {
                operands: operands.to_vec(),
            },
            ty,
        )
    }

    /// Freeze the module and compute def-use chains.
    pub fn finish(mut self) -> Module {
        let mut users: FxHashMap<ValueRef, Vec<InstId>> = FxHashMap::default();
        for (idx, inst) in self.module.insts.iter().enumerate() {
            for op in inst.kind.operands() {
                if matches!(op, ValueRef::ConstInt(_)) {
                    continue;
                }
                let list = users.entry(op).or_default();
                // An instruction using the same value twice is one user.
                if list.last() != Some(&InstId(idx as u32)) {
                    list.push(InstId(idx as u32));
                }
            }
        }
        self.module.users = users;
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_are_interned() {
        let mut b = ModuleBuilder::new();
        let i32_ty = b.int(32);
        let foo1 = b.struct_type("Foo", &[i32_ty]);
        let foo2 = b.struct_type("Foo", &[i32_ty]);
        assert_eq!(foo1, foo2);
        let p1 = b.pointer(foo1);
        let p2 = b.pointer(foo2);
        assert_eq!(p1, p2);
        assert_ne!(b.struct_type("Bar", &[i32_ty]), foo1);
    }

    #[test]
    fn test_users_and_successors() {
        let mut b = ModuleBuilder::new();
        let i64_ty = b.int(64);
        let void = b.void();
        let f = b.function("f", &[], void);
        let entry = b.block(f, "entry");
        let exit = b.block(f, "exit");
        let slot = b.alloca(entry, i64_ty);
        let st = b.store(entry, ValueRef::ConstInt(1), slot.into());
        let ld = b.load(entry, slot.into(), i64_ty);
        let cmp = b.icmp(entry, IntPredicate::Eq, ld.into(), ValueRef::ConstInt(0));
        b.cond_br(entry, cmp.into(), exit, exit);
        b.ret(exit);
        let m = b.finish();
        assert_eq!(m.users(slot.into()), &[st, ld]);
        assert_eq!(m.users(ld.into()), &[cmp]);
        assert_eq!(m.successors(entry).as_slice(), &[exit, exit]);
        assert!(m.successors(exit).is_empty());
        assert!(!m.function(f).is_declaration());
    }
}

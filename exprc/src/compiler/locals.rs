use std::collections::{HashMap, HashSet};

use exprc_runtime::{LocalSlot, Type};

use crate::error::CompileError;

/// Local slot table of one function.
///
/// Temporaries come from per-type free lists; `declare` hands out a fresh
/// slot that is never returned to a pool.
#[derive(Debug, Default)]
pub(crate) struct LocalPool {
    types: Vec<Type>,
    free: HashMap<Type, Vec<LocalSlot>>,
    borrowed: HashSet<LocalSlot>,
}

impl LocalPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_local(&mut self, ty: &Type) -> LocalSlot {
        let reused = self.free.get_mut(ty).and_then(Vec::pop);
        let slot = reused.unwrap_or_else(|| self.push(ty.clone()));
        self.borrowed.insert(slot);
        slot
    }

    pub(crate) fn free_local(&mut self, slot: LocalSlot) -> Result<(), CompileError> {
        if !self.borrowed.remove(&slot) {
            return Err(CompileError::contract(
                "locals",
                format!("slot {} freed while not borrowed", slot.0),
            ));
        }
        let ty = self.ty(slot).clone();
        self.free.entry(ty).or_default().push(slot);
        Ok(())
    }

    pub(crate) fn declare(&mut self, ty: Type, name: &str) -> LocalSlot {
        let slot = self.push(ty);
        log::trace!("declare local {} `{name}`", slot.0);
        slot
    }

    fn ty(&self, slot: LocalSlot) -> &Type {
        &self.types[slot.0 as usize]
    }

    pub(crate) fn into_types(self) -> Vec<Type> {
        self.types
    }

    fn push(&mut self, ty: Type) -> LocalSlot {
        let slot = LocalSlot(self.types.len() as u32);
        self.types.push(ty);
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_slots_are_reused_per_type() {
        let mut pool = LocalPool::new();
        let a = pool.get_local(&Type::I32);
        let b = pool.get_local(&Type::I32);
        assert_ne!(a, b);
        pool.free_local(a).expect("free");
        let s = pool.get_local(&Type::String);
        assert_ne!(s, a);
        assert_eq!(pool.get_local(&Type::I32), a);
        assert!(pool.borrowed.contains(&a));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = LocalPool::new();
        let slot = pool.get_local(&Type::Bool);
        pool.free_local(slot).expect("first free");
        assert!(pool.free_local(slot).is_err());
    }

    #[test]
    fn declared_slots_never_enter_the_pool() {
        let mut pool = LocalPool::new();
        let named = pool.declare(Type::I32, "x");
        assert!(pool.free_local(named).is_err());
        let temp = pool.get_local(&Type::I32);
        assert_ne!(temp, named);
        assert_eq!(pool.into_types(), vec![Type::I32, Type::I32]);
    }
}

//! Targets without native unwinding support report no loaded objects.

use super::LoadedObject;

pub(super) fn loaded_objects() -> Vec<LoadedObject>
{
    Vec::new()
}

pub(super) fn thread_stack_bounds() -> Option<(u64, u64)>
{
    None
}

pub(super) fn signal_safe_stack_bounds() -> Option<(u64, u64)>
{
    None
}

pub(super) fn read_word(_address: u64) -> Option<u64>
{
    None
}

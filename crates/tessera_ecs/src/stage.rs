// stage.rs - Deferred structural mutation
//
// While a deferred region is open, structural mutations are recorded here
// instead of applied, so an in-progress iteration keeps seeing a consistent
// snapshot. Replay happens when the outermost region closes, in strict
// program order, through the normal non-deferred entry points.

use crate::entity::{Entity, Id};
use crate::error::{EcsError, EcsResult};

/// A component value parked in the queue between record and replay.
///
/// Owns the raw bytes of one moved-in value together with its drop hook,
/// so a command that never replays (a failed push, or a world dropped with
/// a region still open) does not leak heap-owning components.
pub struct StagedValue {
    bytes: Box<[u8]>,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

impl StagedValue {
    pub fn new(bytes: Box<[u8]>, drop_fn: Option<unsafe fn(*mut u8)>) -> Self {
        Self { bytes, drop_fn }
    }

    /// Hand the bytes over for replay, defusing the drop hook; the
    /// receiver owns the value from here.
    pub fn into_bytes(mut self) -> Box<[u8]> {
        self.drop_fn = None;
        std::mem::take(&mut self.bytes)
    }
}

impl Drop for StagedValue {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            if !self.bytes.is_empty() {
                // SAFETY: the buffer still holds the initialized value the
                // hook was registered for.
                unsafe { drop_fn(self.bytes.as_mut_ptr()) }
            }
        }
    }
}

impl std::fmt::Debug for StagedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedValue")
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// A recorded structural operation.
///
/// Entity creation is absent on purpose: allocating a handle is not a
/// structural change (the new entity occupies no table row until its first
/// add), so `spawn` works identically inside and outside deferred regions.
#[derive(Debug)]
pub enum Command {
    Add { entity: Entity, id: Id },
    Remove { entity: Entity, id: Id },
    Set { entity: Entity, id: Id, value: StagedValue },
    Despawn { entity: Entity },
}

/// FIFO queue of commands plus the defer-nesting counter.
///
/// A spawn-then-despawn of the same entity within one region is replayed as
/// both operations; the end state is identical to coalescing them and the
/// simpler replay keeps ordering reasoning trivial.
#[derive(Default)]
pub struct CommandBuffer {
    queue: Vec<Command>,
    depth: u32,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a (possibly nested) deferred region.
    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// Close one region. Returns true when the outermost region closed and
    /// the queue must be replayed.
    pub fn end(&mut self) -> bool {
        debug_assert!(self.depth > 0, "end_defer without begin_defer");
        self.depth = self.depth.saturating_sub(1);
        self.depth == 0
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.depth > 0
    }

    /// Record a command. Growth failure is reported, never silently
    /// dropped.
    pub fn push(&mut self, command: Command) -> EcsResult<()> {
        self.queue
            .try_reserve(1)
            .map_err(|_| EcsError::AllocFailed {
                bytes: std::mem::size_of::<Command>(),
            })?;
        self.queue.push(command);
        Ok(())
    }

    /// Take the queued commands for replay, in recording order.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn nesting_replays_only_at_outermost_end() {
        let mut buffer = CommandBuffer::new();
        buffer.begin();
        buffer.begin();
        assert!(buffer.is_deferred());
        assert!(!buffer.end());
        assert!(buffer.is_deferred());
        assert!(buffer.end());
        assert!(!buffer.is_deferred());
    }

    #[test]
    fn dropping_a_queued_set_runs_the_value_drop_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static HOOK_RUNS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count(_: *mut u8) {
            HOOK_RUNS.fetch_add(1, Ordering::SeqCst);
        }

        let e = Entity::from_parts(1, 0);
        let id = Id::of(Entity::from_parts(2, 0));

        let mut buffer = CommandBuffer::new();
        buffer.begin();
        let value = StagedValue::new(vec![0u8; 8].into_boxed_slice(), Some(count));
        buffer.push(Command::Set { entity: e, id, value }).unwrap();
        assert!(buffer.end());
        drop(buffer);
        assert_eq!(HOOK_RUNS.load(Ordering::SeqCst), 1);

        // Replayed values hand their bytes over and must not re-run the hook.
        let replayed = StagedValue::new(vec![0u8; 8].into_boxed_slice(), Some(count));
        let bytes = replayed.into_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(HOOK_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commands_drain_in_recording_order() {
        let mut buffer = CommandBuffer::new();
        let e = Entity::from_parts(1, 0);
        let a = Id::of(Entity::from_parts(2, 0));
        let b = Id::of(Entity::from_parts(3, 0));
        buffer.begin();
        buffer.push(Command::Add { entity: e, id: a }).unwrap();
        buffer.push(Command::Add { entity: e, id: b }).unwrap();
        buffer.push(Command::Despawn { entity: e }).unwrap();
        assert!(buffer.end());

        let drained = buffer.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0], Command::Add { id, .. } if id == a));
        assert!(matches!(drained[1], Command::Add { id, .. } if id == b));
        assert!(matches!(drained[2], Command::Despawn { .. }));
        assert!(buffer.is_empty());
    }
}

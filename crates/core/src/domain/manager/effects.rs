//! Effect registration and placement
//!
//! Effects are attached to a session on a given mix; when the session's
//! playback moves between outputs, its effects move with it. Total effect
//! memory is capped so one misbehaving client cannot exhaust the DSP.

use super::PolicyManager;
use crate::domain::audio::{IoHandle, PolicyError, Result, Session, StreamType};
use crate::domain::engine::Strategy;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Total memory the loaded effects may claim, in bytes
const MAX_EFFECTS_MEMORY: u32 = 512 * 1024;

/// One registered effect instance
#[derive(Debug, Clone)]
pub struct EffectDescriptor {
    pub id: u32,
    pub name: String,
    pub session: Session,
    pub io: IoHandle,
    /// Strategy the effect's session renders under, when known
    pub strategy: Option<Strategy>,
    pub enabled: bool,
    /// Offload-capable effects do not pin their output to the mixer path
    pub offloadable: bool,
    pub memory: u32,
}

#[derive(Debug, Default)]
pub(super) struct EffectRegistry {
    effects: BTreeMap<u32, EffectDescriptor>,
    total_memory: u32,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, desc: EffectDescriptor) -> Result<()> {
        if self.effects.contains_key(&desc.id) {
            return Err(PolicyError::InvalidState(format!(
                "effect {} already registered",
                desc.id
            )));
        }
        let new_total = self.total_memory.saturating_add(desc.memory);
        if new_total > MAX_EFFECTS_MEMORY {
            return Err(PolicyError::ResourceExhausted(format!(
                "effect memory limit exceeded: {new_total} > {MAX_EFFECTS_MEMORY}"
            )));
        }
        debug!(id = desc.id, name = %desc.name, io = %desc.io, "effect registered");
        self.total_memory = new_total;
        self.effects.insert(desc.id, desc);
        Ok(())
    }

    pub fn unregister(&mut self, id: u32) -> Result<EffectDescriptor> {
        let desc = self
            .effects
            .remove(&id)
            .ok_or_else(|| PolicyError::NotFound(format!("effect {id} not registered")))?;
        self.total_memory = self.total_memory.saturating_sub(desc.memory);
        debug!(id, "effect unregistered");
        Ok(desc)
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> Result<()> {
        let desc = self
            .effects
            .get_mut(&id)
            .ok_or_else(|| PolicyError::NotFound(format!("effect {id} not registered")))?;
        desc.enabled = enabled;
        Ok(())
    }

    /// True when any enabled effect would break an offloaded path
    pub fn non_offloadable_enabled(&self) -> bool {
        self.effects
            .values()
            .any(|e| e.enabled && !e.offloadable)
    }

    /// Retarget every effect on `src` and report the sessions that moved
    pub fn retarget(&mut self, src: IoHandle, dst: IoHandle) -> Vec<Session> {
        let mut sessions = Vec::new();
        for desc in self.effects.values_mut() {
            if desc.io == src {
                desc.io = dst;
                if !sessions.contains(&desc.session) {
                    sessions.push(desc.session);
                }
            }
        }
        sessions
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectDescriptor> {
        self.effects.values()
    }

    pub fn total_memory(&self) -> u32 {
        self.total_memory
    }
}

impl PolicyManager {
    pub fn register_effect(&mut self, desc: EffectDescriptor) -> Result<()> {
        if !desc.io.is_none() && !self.outputs.contains(desc.io) && self.inputs.get(desc.io).is_none()
        {
            return Err(PolicyError::NotFound(format!(
                "io {} not found for effect {}",
                desc.io, desc.id
            )));
        }
        self.effects.register(desc)
    }

    pub fn unregister_effect(&mut self, id: u32) -> Result<()> {
        self.effects.unregister(id).map(|_| ())
    }

    pub fn set_effect_enabled(&mut self, id: u32, enabled: bool) -> Result<()> {
        self.effects.set_enabled(id, enabled)?;
        // Clients playing on an offloaded path must renegotiate once a
        // mixer-only effect engages
        if enabled
            && self.is_non_offloadable_effect_enabled()
            && self.outputs.iter().any(|d| d.is_offloaded())
        {
            self.client.invalidate_stream(StreamType::Music);
        }
        Ok(())
    }

    /// Offloaded outputs cannot host mixer-path effects
    pub fn is_non_offloadable_effect_enabled(&self) -> bool {
        self.effects.non_offloadable_enabled()
    }

    /// Move every effect riding on `src` over to `dst`, registry and HAL both
    pub(super) fn move_session_effects(&mut self, src: IoHandle, dst: IoHandle) {
        if src == dst {
            return;
        }
        let sessions = self.effects.retarget(src, dst);
        for session in sessions {
            debug!(%session, %src, %dst, "moving session effects");
            if let Err(e) = self.client.move_effects(session, src, dst) {
                warn!(%session, error = %e, "effect move failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn effect(id: u32, io: IoHandle, memory: u32) -> EffectDescriptor {
        EffectDescriptor {
            id,
            name: format!("fx{id}"),
            session: Session::new(100 + id),
            io,
            strategy: None,
            enabled: false,
            offloadable: false,
            memory,
        }
    }

    #[test]
    fn test_memory_cap() {
        let mut registry = EffectRegistry::new();
        registry
            .register(effect(1, IoHandle::new(1), MAX_EFFECTS_MEMORY - 10))
            .unwrap();
        let err = registry
            .register(effect(2, IoHandle::new(1), 11))
            .unwrap_err();
        assert!(matches!(err, PolicyError::ResourceExhausted(_)));

        registry.unregister(1).unwrap();
        assert_eq!(registry.total_memory(), 0);
        registry.register(effect(2, IoHandle::new(1), 11)).unwrap();
    }

    #[test]
    fn test_retarget_reports_sessions_once() {
        let mut registry = EffectRegistry::new();
        let a = effect(1, IoHandle::new(1), 16);
        let mut b = effect(2, IoHandle::new(1), 16);
        b.session = a.session;
        let mut c = effect(3, IoHandle::new(2), 16);
        c.session = Session::new(7);
        registry.register(a).unwrap();
        registry.register(b).unwrap();
        registry.register(c).unwrap();

        let moved = registry.retarget(IoHandle::new(1), IoHandle::new(3));
        assert_eq!(moved.len(), 1);
        assert!(registry.iter().filter(|e| e.io == IoHandle::new(3)).count() == 2);
        assert!(registry.iter().any(|e| e.io == IoHandle::new(2)));
    }

    #[test]
    fn test_non_offloadable_tracking() {
        let mut registry = EffectRegistry::new();
        let mut fx = effect(1, IoHandle::new(1), 16);
        fx.offloadable = false;
        registry.register(fx).unwrap();
        assert!(!registry.non_offloadable_enabled());

        registry.set_enabled(1, true).unwrap();
        assert!(registry.non_offloadable_enabled());

        registry.set_enabled(1, false).unwrap();
        assert!(!registry.non_offloadable_enabled());
    }
}

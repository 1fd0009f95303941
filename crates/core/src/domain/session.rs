//! Per-session preferred-device routes
//!
//! A client can pin one of its sessions to a specific device. Routes are
//! consulted before strategy resolution and only win while the session is
//! actually active, tracked with an activity counter.

use crate::domain::audio::{InputSource, Session, StreamType, Uid};
use crate::domain::device::{DeviceSet, DeviceType};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What traffic a route applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Output(StreamType),
    Input(InputSource),
}

/// One pinned device for one session
#[derive(Debug, Clone)]
pub struct SessionRoute {
    pub session: Session,
    pub kind: RouteKind,
    pub device: DeviceType,
    pub owner: Uid,
    /// Clients holding the route open
    ref_count: u32,
    /// Started (not yet stopped) streams or captures on the session
    activity_count: u32,
}

/// Session-indexed route table; the manager keeps one per direction
#[derive(Debug, Default)]
pub struct SessionRouteMap {
    routes: BTreeMap<Session, SessionRoute>,
}

impl SessionRouteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or retain a route; an existing route for the session keeps its
    /// activity but switches to the new device.
    pub fn set_route(&mut self, session: Session, kind: RouteKind, device: DeviceType, owner: Uid) {
        match self.routes.get_mut(&session) {
            Some(route) => {
                route.ref_count += 1;
                if route.device != device {
                    debug!(%session, old = %route.device, new = %device, "session route retargeted");
                    route.device = device;
                    route.kind = kind;
                }
            }
            None => {
                debug!(%session, %device, "session route installed");
                self.routes.insert(
                    session,
                    SessionRoute {
                        session,
                        kind,
                        device,
                        owner,
                        ref_count: 1,
                        activity_count: 0,
                    },
                );
            }
        }
    }

    /// Drop one reference; the route disappears when nobody holds it
    pub fn release_route(&mut self, session: Session) {
        let remove = match self.routes.get_mut(&session) {
            Some(route) => {
                if route.ref_count == 0 {
                    warn!(%session, "unbalanced session route release");
                    true
                } else {
                    route.ref_count -= 1;
                    route.ref_count == 0
                }
            }
            None => false,
        };
        if remove {
            self.routes.remove(&session);
        }
    }

    pub fn start_activity(&mut self, session: Session) {
        if let Some(route) = self.routes.get_mut(&session) {
            route.activity_count += 1;
        }
    }

    pub fn stop_activity(&mut self, session: Session) {
        if let Some(route) = self.routes.get_mut(&session) {
            if route.activity_count == 0 {
                warn!(%session, "unbalanced session activity stop");
            } else {
                route.activity_count -= 1;
            }
        }
    }

    pub fn get(&self, session: Session) -> Option<&SessionRoute> {
        self.routes.get(&session)
    }

    /// Device pinned by this session if it is present and plugged in
    pub fn active_device_for_session(
        &self,
        session: Session,
        available: DeviceSet,
    ) -> Option<DeviceType> {
        self.routes
            .get(&session)
            .filter(|r| available.contains(r.device))
            .map(|r| r.device)
    }

    /// Device pinned by any active session playing this stream type
    pub fn active_device_for_stream(
        &self,
        stream: StreamType,
        available: DeviceSet,
    ) -> Option<DeviceType> {
        self.routes
            .values()
            .find(|r| {
                r.activity_count > 0
                    && r.kind == RouteKind::Output(stream)
                    && available.contains(r.device)
            })
            .map(|r| r.device)
    }

    /// Device pinned by any active session capturing this source
    pub fn active_device_for_source(
        &self,
        source: InputSource,
        available: DeviceSet,
    ) -> Option<DeviceType> {
        self.routes
            .values()
            .find(|r| {
                r.activity_count > 0
                    && r.kind == RouteKind::Input(source)
                    && available.contains(r.device)
            })
            .map(|r| r.device)
    }

    /// Drop every route owned by a uid; returns how many went away
    pub fn remove_for_uid(&mut self, uid: Uid) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, r| r.owner != uid);
        before - self.routes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: Uid = Uid(10_042);

    #[test]
    fn test_route_wins_only_while_active() {
        let mut routes = SessionRouteMap::new();
        let session = Session::new(5);
        let available = DeviceSet::of(DeviceType::UsbDevice) | DeviceSet::of(DeviceType::Speaker);

        routes.set_route(
            session,
            RouteKind::Output(StreamType::Music),
            DeviceType::UsbDevice,
            UID,
        );
        assert_eq!(
            routes.active_device_for_stream(StreamType::Music, available),
            None
        );

        routes.start_activity(session);
        assert_eq!(
            routes.active_device_for_stream(StreamType::Music, available),
            Some(DeviceType::UsbDevice)
        );

        routes.stop_activity(session);
        assert_eq!(
            routes.active_device_for_stream(StreamType::Music, available),
            None
        );
    }

    #[test]
    fn test_route_ignored_when_device_gone() {
        let mut routes = SessionRouteMap::new();
        let session = Session::new(5);
        routes.set_route(
            session,
            RouteKind::Output(StreamType::Music),
            DeviceType::UsbDevice,
            UID,
        );
        routes.start_activity(session);
        assert_eq!(
            routes.active_device_for_stream(StreamType::Music, DeviceSet::of(DeviceType::Speaker)),
            None
        );
    }

    #[test]
    fn test_ref_counted_release() {
        let mut routes = SessionRouteMap::new();
        let session = Session::new(9);
        routes.set_route(
            session,
            RouteKind::Input(InputSource::Mic),
            DeviceType::WiredHeadsetMic,
            UID,
        );
        routes.set_route(
            session,
            RouteKind::Input(InputSource::Mic),
            DeviceType::WiredHeadsetMic,
            UID,
        );

        routes.release_route(session);
        assert!(routes.get(session).is_some());
        routes.release_route(session);
        assert!(routes.get(session).is_none());
    }

    #[test]
    fn test_remove_for_uid() {
        let mut routes = SessionRouteMap::new();
        routes.set_route(
            Session::new(1),
            RouteKind::Output(StreamType::Music),
            DeviceType::Speaker,
            Uid(1),
        );
        routes.set_route(
            Session::new(2),
            RouteKind::Output(StreamType::Music),
            DeviceType::Speaker,
            Uid(2),
        );
        assert_eq!(routes.remove_for_uid(Uid(1)), 1);
        assert_eq!(routes.len(), 1);
    }
}

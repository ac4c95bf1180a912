//! Post-step notifications (body state, area monitoring)

use crate::object::ObjectRid;
use rapier3d::na::{Isometry3, Vector3};

/// State of a body after a step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    pub transform: Isometry3<f32>,
    pub linear_velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
    pub sleeping: bool,
}

/// Type of monitor event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEventKind {
    /// A shape entered the area
    Entered,
    /// A shape left the area
    Exited,
}

/// A shape of another object entering or leaving an area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorEvent {
    pub kind: MonitorEventKind,
    /// Object that entered or left
    pub other: ObjectRid,
    /// Host instance of that object
    pub other_instance_id: u64,
    /// Its shape index, if the object still exists
    pub other_shape: Option<usize>,
    /// Index of the area's own shape
    pub self_shape: Option<usize>,
    /// Whether the other object is itself an area
    pub other_is_area: bool,
}

impl MonitorEvent {
    pub fn is_entered(&self) -> bool {
        self.kind == MonitorEventKind::Entered
    }

    pub fn is_exited(&self) -> bool {
        self.kind == MonitorEventKind::Exited
    }
}

/// One queued notification
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BodyState { object: ObjectRid, state: BodyState },
    AreaMonitor { area: ObjectRid, event: MonitorEvent },
}

impl Notification {
    /// Object the notification is delivered to
    pub fn target(&self) -> ObjectRid {
        match self {
            Self::BodyState { object, .. } => *object,
            Self::AreaMonitor { area, .. } => *area,
        }
    }

    pub fn is_area(&self) -> bool {
        matches!(self, Self::AreaMonitor { .. })
    }
}

/// Notifications gathered during a step, bodies ahead of areas
#[derive(Debug, Default)]
pub struct NotificationQueue {
    bodies: Vec<Notification>,
    areas: Vec<Notification>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notification: Notification) {
        if notification.is_area() {
            self.areas.push(notification);
        } else {
            self.bodies.push(notification);
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len() + self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty() && self.areas.is_empty()
    }

    /// Queued notifications in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.bodies.iter().chain(self.areas.iter())
    }

    /// Drop every queued notification addressed to `object`
    pub fn forget(&mut self, object: ObjectRid) {
        self.bodies.retain(|n| n.target() != object);
        self.areas.retain(|n| n.target() != object);
    }

    /// Take everything, body notifications first
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = std::mem::take(&mut self.bodies);
        out.append(&mut self.areas);
        out
    }
}

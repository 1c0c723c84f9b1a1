//! The replicated tank.
//!
//! All state lives in a `PropertyBag` whose export is exactly the `update`
//! snapshot. Local input and remote snapshots both write through the bag, so
//! the health clamp and the destroyed transition behave the same for the
//! local tank and for proxies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use peer_mesh::{PeerId, ReplicatedEntity};
use property_bag::{
    BagError, Listeners, PropertyBag, PropertyDefinition, PropertyValue, Snapshot, Subscription,
};
use tracing::{debug, info};

pub const MAX_HEALTH: f64 = 100.0;

/// Metres per second per unit of net engine force.
const SPEED_PER_FORCE: f64 = 0.01;
/// Radians per second at full steering lock.
const TURN_RATE: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TankEvent {
    /// Health reached zero.
    Destroyed,
}

pub struct Tank {
    bag: PropertyBag,
    destroyed: Arc<AtomicBool>,
    events: Listeners<TankEvent>,
}

impl std::fmt::Debug for Tank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tank")
            .field("uuid", &self.uuid())
            .field("health", &self.health())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Tank {
    pub fn new(uuid: &PeerId, pseudo: &str, vehicle: &str) -> Self {
        let destroyed = Arc::new(AtomicBool::new(false));
        let events = Listeners::new();
        let mut bag = PropertyBag::new();

        define(&mut bag, "uuid", PropertyDefinition::stored(uuid.to_string()));
        define(&mut bag, "pseudo", PropertyDefinition::stored(pseudo.to_string()));
        define(&mut bag, "type", PropertyDefinition::stored(vehicle.to_string()));
        define(&mut bag, "turretAngle", PropertyDefinition::stored(0.0_f64));
        define(&mut bag, "canonAngle", PropertyDefinition::stored(0.0_f64));
        define(
            &mut bag,
            "steering",
            PropertyDefinition::stored(0.0_f64).sanitize(|s: f64| s.clamp(-1.0, 1.0)),
        );
        define(&mut bag, "engineForce", PropertyDefinition::stored(0.0_f64));
        define(
            &mut bag,
            "breakingForce",
            PropertyDefinition::stored(0.0_f64).sanitize(|b: f64| b.max(0.0)),
        );
        define(&mut bag, "position", PropertyDefinition::stored([0.0_f64; 3]));
        define(&mut bag, "rotation", PropertyDefinition::stored([0.0_f64, 0.0, 0.0, 1.0]));
        define(&mut bag, "headlights", PropertyDefinition::stored(false));

        let flag = destroyed.clone();
        let notify = events.clone();
        define(
            &mut bag,
            "health",
            PropertyDefinition::stored(MAX_HEALTH)
                .sanitize(|h: f64| h.clamp(0.0, MAX_HEALTH))
                .on_change(move |new: &f64, old: &f64| {
                    if *new <= 0.0 && *old > 0.0 {
                        flag.store(true, Ordering::SeqCst);
                        notify.emit(&TankEvent::Destroyed);
                    } else if *new > 0.0 {
                        flag.store(false, Ordering::SeqCst);
                    }
                }),
        );

        Self {
            bag,
            destroyed,
            events,
        }
    }

    /// Blank tank for a remote uuid; the first snapshot fills it in.
    pub fn proxy(uuid: &PeerId) -> Self {
        Self::new(uuid, "", "")
    }

    pub fn bag(&self) -> &PropertyBag {
        &self.bag
    }

    pub fn bag_mut(&mut self) -> &mut PropertyBag {
        &mut self.bag
    }

    pub fn uuid(&self) -> String {
        self.read("uuid")
    }

    pub fn pseudo(&self) -> String {
        self.read("pseudo")
    }

    pub fn health(&self) -> f64 {
        self.read("health")
    }

    pub fn position(&self) -> [f64; 3] {
        self.read("position")
    }

    pub fn rotation(&self) -> [f64; 4] {
        self.read("rotation")
    }

    pub fn turret_angle(&self) -> f64 {
        self.read("turretAngle")
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn set_health(&mut self, health: f64) -> Result<bool, BagError> {
        self.bag.set("health", health)
    }

    pub fn damage(&mut self, amount: f64) -> Result<bool, BagError> {
        self.bag.update("health", |h: f64| h - amount)
    }

    pub fn set_controls(
        &mut self,
        steering: f64,
        engine_force: f64,
        breaking_force: f64,
    ) -> Result<(), BagError> {
        self.bag.set("steering", steering)?;
        self.bag.set("engineForce", engine_force)?;
        self.bag.set("breakingForce", breaking_force)?;
        Ok(())
    }

    pub fn toggle_headlights(&mut self) -> Result<bool, BagError> {
        self.bag.update("headlights", |on: bool| !on)
    }

    /// Unit vector along the barrel, from hull yaw plus turret angle.
    pub fn aim(&self) -> [f64; 3] {
        let heading = yaw(self.rotation()) + self.turret_angle();
        [heading.sin(), 0.0, heading.cos()]
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TankEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    fn read<T: PropertyValue + Default>(&self, key: &str) -> T {
        self.bag.get(key).unwrap_or_default()
    }

    fn write<T: PropertyValue>(&mut self, key: &str, value: T) {
        if let Err(e) = self.bag.set(key, value) {
            debug!(key, "tank write failed: {}", e);
        }
    }
}

impl ReplicatedEntity for Tank {
    fn export(&self) -> Result<Snapshot, BagError> {
        self.bag.export()
    }

    fn import(&mut self, snapshot: &Snapshot) {
        self.bag.import(snapshot);
    }

    /// Simple kinematic model: net force drives forward speed, steering
    /// turns the hull about the vertical axis.
    fn advance(&mut self, dt: Duration) {
        if self.is_destroyed() {
            return;
        }
        let secs = dt.as_secs_f64();
        let engine: f64 = self.read("engineForce");
        let brake: f64 = self.read("breakingForce");
        let steering: f64 = self.read("steering");

        let speed = (engine - brake.copysign(engine)) * SPEED_PER_FORCE;
        if speed == 0.0 {
            return;
        }
        let heading = yaw(self.rotation()) + steering * TURN_RATE * secs;
        let distance = speed * secs;

        let mut position = self.position();
        position[0] += heading.sin() * distance;
        position[2] += heading.cos() * distance;
        self.write("position", position);
        self.write("rotation", from_yaw(heading));
    }

    fn destroy(&mut self) {
        info!(uuid = %self.uuid(), pseudo = %self.pseudo(), "tank removed");
    }
}

fn define<T: PropertyValue>(bag: &mut PropertyBag, key: &str, definition: PropertyDefinition<T>) {
    if let Err(e) = bag.add_property(key, definition) {
        debug!(key, "tank property not registered: {}", e);
    }
}

/// Rotation about +Y encoded in an `[x, y, z, w]` quaternion.
fn yaw(q: [f64; 4]) -> f64 {
    2.0 * q[1].atan2(q[3])
}

fn from_yaw(angle: f64) -> [f64; 4] {
    let half = angle / 2.0;
    [0.0, half.sin(), 0.0, half.cos()]
}

//! Rigid-body bridge - one owner thread holds the rapier2d world
//!
//! Callers never touch rapier types. Body handles are assigned on the calling
//! side, so `create_body` returns at once; every command then travels over a
//! single channel and is applied in send order by the owner thread. Hitbox
//! rebuilds are acknowledged through [`RigidBodyBridge::poll_completions`].

use crate::error::BridgeError;
use crate::physics::outline::{CollisionMask, Polygon};
use glam::Vec2;
use rapier2d::prelude::*;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Opaque body id handed out by the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(pub u64);

/// Id of an asynchronous hitbox rebuild
pub type JobId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    Static,
    Dynamic,
    Kinematic,
}

/// Collision group membership and filter bits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollisionFilter {
    pub memberships: u32,
    pub filter: u32,
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self {
            memberships: u32::MAX,
            filter: u32::MAX,
        }
    }
}

impl CollisionFilter {
    fn groups(self) -> InteractionGroups {
        InteractionGroups::new(
            Group::from_bits_truncate(self.memberships),
            Group::from_bits_truncate(self.filter),
        )
    }
}

#[derive(Clone, Debug)]
pub struct BodyDesc {
    pub kind: BodyKind,
    pub position: Vec2,
    pub angle: f32,
    /// Polygons in body-local coordinates
    pub shapes: Vec<Polygon>,
    pub density: f32,
    pub friction: f32,
    pub filter: CollisionFilter,
    /// Used for the hitbox when `shapes` is empty
    pub mask: Option<CollisionMask>,
}

impl BodyDesc {
    pub fn new(kind: BodyKind, position: Vec2, shapes: Vec<Polygon>) -> Self {
        Self {
            kind,
            position,
            angle: 0.0,
            shapes,
            density: 1.0,
            friction: 0.5,
            filter: CollisionFilter::default(),
            mask: None,
        }
    }

    pub fn with_mask(kind: BodyKind, position: Vec2, mask: CollisionMask) -> Self {
        Self {
            mask: Some(mask),
            ..Self::new(kind, position, Vec::new())
        }
    }
}

/// One collider attached to a body
#[derive(Clone, Debug, PartialEq)]
pub struct FixtureInfo {
    pub min: Vec2,
    pub max: Vec2,
    pub filter: CollisionFilter,
    pub density: f32,
    pub friction: f32,
    /// Area covered by the collider's shape
    pub area: f32,
}

enum BridgeCommand {
    Create {
        handle: BodyHandle,
        desc: Box<BodyDesc>,
    },
    UpdateHitbox {
        handle: BodyHandle,
        shapes: Vec<Polygon>,
        job: JobId,
    },
    UpdateHitboxFromMask {
        handle: BodyHandle,
        mask: Option<CollisionMask>,
        job: JobId,
    },
    SetFilter {
        handle: BodyHandle,
        filter: CollisionFilter,
    },
    QueryFixtures {
        handle: BodyHandle,
        reply: Sender<Result<Vec<FixtureInfo>, BridgeError>>,
    },
    Transform {
        handle: BodyHandle,
        reply: Sender<Option<(Vec2, f32)>>,
    },
    Destroy {
        handle: BodyHandle,
    },
    Step {
        dt: f32,
    },
    Shutdown,
}

pub struct RigidBodyBridge {
    commands: Sender<BridgeCommand>,
    completions: Receiver<JobId>,
    next_handle: u64,
    next_job: JobId,
    owner: Option<JoinHandle<()>>,
}

impl RigidBodyBridge {
    /// Spawn the owner thread
    pub fn spawn() -> std::io::Result<Self> {
        let (command_tx, command_rx) = channel::<BridgeCommand>();
        let (completion_tx, completion_rx) = channel::<JobId>();

        let owner = thread::Builder::new()
            .name("rigid-body-bridge".to_string())
            .spawn(move || {
                let mut world = PhysicsWorld::new();
                while let Ok(command) = command_rx.recv() {
                    if matches!(command, BridgeCommand::Shutdown) {
                        break;
                    }
                    if let Some(job) = world.apply(command) {
                        let _ = completion_tx.send(job);
                    }
                }
                log::debug!("[PHYSICS] Bridge owner stopped with {} bodies", world.bodies.len());
            })?;

        Ok(Self {
            commands: command_tx,
            completions: completion_rx,
            next_handle: 1,
            next_job: 1,
            owner: Some(owner),
        })
    }

    fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|_| BridgeError::Disconnected)
    }

    fn next_job(&mut self) -> JobId {
        let job = self.next_job;
        self.next_job += 1;
        job
    }

    pub fn create_body(&mut self, desc: BodyDesc) -> Result<BodyHandle, BridgeError> {
        if desc.shapes.is_empty() && desc.mask.is_none() {
            return Err(BridgeError::NoShape);
        }
        let handle = BodyHandle(self.next_handle);
        self.next_handle += 1;
        self.send(BridgeCommand::Create {
            handle,
            desc: Box::new(desc),
        })?;
        Ok(handle)
    }

    /// Replace all colliders of a body; an empty list leaves it shapeless
    pub fn update_hitbox(&mut self, handle: BodyHandle, shapes: Vec<Polygon>) -> Result<JobId, BridgeError> {
        let job = self.next_job();
        self.send(BridgeCommand::UpdateHitbox { handle, shapes, job })?;
        Ok(job)
    }

    /// Rebuild the hitbox from the body's mask, optionally replacing the mask first
    pub fn update_hitbox_from_mask(
        &mut self,
        handle: BodyHandle,
        mask: Option<CollisionMask>,
    ) -> Result<JobId, BridgeError> {
        let job = self.next_job();
        self.send(BridgeCommand::UpdateHitboxFromMask { handle, mask, job })?;
        Ok(job)
    }

    pub fn set_filter(&self, handle: BodyHandle, filter: CollisionFilter) -> Result<(), BridgeError> {
        self.send(BridgeCommand::SetFilter { handle, filter })
    }

    /// Blocks until the owner thread has applied every earlier command
    pub fn query_fixtures(&self, handle: BodyHandle) -> Result<Vec<FixtureInfo>, BridgeError> {
        let (reply, response) = channel();
        self.send(BridgeCommand::QueryFixtures { handle, reply })?;
        response.recv().map_err(|_| BridgeError::Disconnected)?
    }

    pub fn body_transform(&self, handle: BodyHandle) -> Result<(Vec2, f32), BridgeError> {
        let (reply, response) = channel();
        self.send(BridgeCommand::Transform { handle, reply })?;
        response
            .recv()
            .map_err(|_| BridgeError::Disconnected)?
            .ok_or(BridgeError::UnknownBody(handle.0))
    }

    pub fn destroy_body(&self, handle: BodyHandle) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Destroy { handle })
    }

    pub fn step(&self, dt: f32) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Step { dt })
    }

    /// Hitbox jobs the owner thread has finished since the last call
    pub fn poll_completions(&self) -> Vec<JobId> {
        self.completions.try_iter().collect()
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.send(BridgeCommand::Shutdown);
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                log::error!("[PHYSICS] Bridge owner thread panicked");
            }
        }
    }
}

impl Drop for RigidBodyBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BodyEntry {
    body: RigidBodyHandle,
    kind: BodyKind,
    density: f32,
    friction: f32,
    filter: CollisionFilter,
    mask: Option<CollisionMask>,
}

/// rapier2d state, only ever touched by the owner thread
struct PhysicsWorld {
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: BroadPhase,
    narrow_phase: NarrowPhase,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    bodies: HashMap<BodyHandle, BodyEntry>,
}

impl PhysicsWorld {
    fn new() -> Self {
        let integration_parameters = IntegrationParameters {
            dt: 1.0 / 60.0,
            ..Default::default()
        };

        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: BroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            bodies: HashMap::new(),
        }
    }

    /// Apply one command; returns the finished hitbox job, if any
    fn apply(&mut self, command: BridgeCommand) -> Option<JobId> {
        match command {
            BridgeCommand::Create { handle, desc } => {
                self.create(handle, *desc);
                None
            }
            BridgeCommand::UpdateHitbox { handle, shapes, job } => {
                self.rebuild_colliders(handle, &shapes);
                Some(job)
            }
            BridgeCommand::UpdateHitboxFromMask { handle, mask, job } => {
                let shapes = self.bodies.get_mut(&handle).and_then(|entry| {
                    if mask.is_some() {
                        entry.mask = mask;
                    }
                    entry.mask.as_ref().map(CollisionMask::outline)
                });
                match shapes {
                    Some(shapes) => self.rebuild_colliders(handle, &shapes),
                    None => log::warn!("[PHYSICS] Body {:?} has no collision mask", handle),
                }
                Some(job)
            }
            BridgeCommand::SetFilter { handle, filter } => {
                self.set_filter(handle, filter);
                None
            }
            BridgeCommand::QueryFixtures { handle, reply } => {
                let _ = reply.send(self.fixtures(handle));
                None
            }
            BridgeCommand::Transform { handle, reply } => {
                let _ = reply.send(self.transform(handle));
                None
            }
            BridgeCommand::Destroy { handle } => {
                self.destroy(handle);
                None
            }
            BridgeCommand::Step { dt } => {
                self.step(dt);
                None
            }
            BridgeCommand::Shutdown => None,
        }
    }

    fn create(&mut self, handle: BodyHandle, desc: BodyDesc) {
        let builder = match desc.kind {
            BodyKind::Static => RigidBodyBuilder::fixed(),
            BodyKind::Dynamic => RigidBodyBuilder::dynamic(),
            BodyKind::Kinematic => RigidBodyBuilder::kinematic_position_based(),
        };
        let body = builder
            .translation(vector![desc.position.x, desc.position.y])
            .rotation(desc.angle)
            .build();
        let body = self.rigid_body_set.insert(body);

        let shapes = if desc.shapes.is_empty() {
            desc.mask.as_ref().map(CollisionMask::outline).unwrap_or_default()
        } else {
            desc.shapes
        };

        self.bodies.insert(
            handle,
            BodyEntry {
                body,
                kind: desc.kind,
                density: desc.density,
                friction: desc.friction,
                filter: desc.filter,
                mask: desc.mask,
            },
        );
        self.rebuild_colliders(handle, &shapes);

        log::debug!(
            "[PHYSICS] Created {:?} body {:?} at ({:.1}, {:.1}) with {} shapes",
            desc.kind,
            handle,
            desc.position.x,
            desc.position.y,
            shapes.len()
        );
    }

    fn build_collider(entry: &BodyEntry, shape: &Polygon) -> Option<Collider> {
        if shape.len() < 3 {
            return None;
        }
        let points: Vec<Point<Real>> = shape.points.iter().map(|p| point![p.x, p.y]).collect();

        let builder = match entry.kind {
            // Closed polyline; fixed bodies may be concave
            BodyKind::Static => {
                let mut closed = points;
                closed.push(closed[0]);
                ColliderBuilder::polyline(closed, None)
            }
            // Moving bodies need convex pieces; a hull would fill concave outlines
            BodyKind::Dynamic | BodyKind::Kinematic if shape.signed_area().abs() > f32::EPSILON => {
                let count = points.len() as u32;
                let indices: Vec<[u32; 2]> = (0..count).map(|i| [i, (i + 1) % count]).collect();
                ColliderBuilder::convex_decomposition(&points, &indices)
            }
            BodyKind::Dynamic | BodyKind::Kinematic => {
                let (min, max) = shape.bounds()?;
                let half = ((max - min) * 0.5).max(Vec2::splat(0.05));
                let center = min + (max - min) * 0.5;
                ColliderBuilder::cuboid(half.x, half.y).translation(vector![center.x, center.y])
            }
        };

        Some(
            builder
                .density(entry.density)
                .friction(entry.friction)
                .restitution(0.1)
                .collision_groups(entry.filter.groups())
                .build(),
        )
    }

    fn rebuild_colliders(&mut self, handle: BodyHandle, shapes: &[Polygon]) {
        let Some(entry) = self.bodies.get(&handle) else {
            log::warn!("[PHYSICS] Hitbox update for unknown body {:?}", handle);
            return;
        };
        let body = entry.body;
        let colliders: Vec<Collider> = shapes
            .iter()
            .filter_map(|shape| Self::build_collider(entry, shape))
            .collect();

        let existing: Vec<ColliderHandle> = self
            .rigid_body_set
            .get(body)
            .map(|rb| rb.colliders().to_vec())
            .unwrap_or_default();
        for collider in existing {
            self.collider_set
                .remove(collider, &mut self.island_manager, &mut self.rigid_body_set, true);
        }

        let count = colliders.len();
        for collider in colliders {
            self.collider_set
                .insert_with_parent(collider, body, &mut self.rigid_body_set);
        }
        log::trace!("[PHYSICS] Body {:?} now has {} colliders", handle, count);
    }

    fn set_filter(&mut self, handle: BodyHandle, filter: CollisionFilter) {
        let Some(entry) = self.bodies.get_mut(&handle) else {
            log::warn!("[PHYSICS] Filter update for unknown body {:?}", handle);
            return;
        };
        entry.filter = filter;
        let Some(body) = self.rigid_body_set.get(entry.body) else {
            return;
        };
        for collider in body.colliders() {
            if let Some(collider) = self.collider_set.get_mut(*collider) {
                collider.set_collision_groups(filter.groups());
            }
        }
    }

    fn fixtures(&self, handle: BodyHandle) -> Result<Vec<FixtureInfo>, BridgeError> {
        let entry = self.bodies.get(&handle).ok_or(BridgeError::UnknownBody(handle.0))?;
        let body = self
            .rigid_body_set
            .get(entry.body)
            .ok_or(BridgeError::UnknownBody(handle.0))?;

        Ok(body
            .colliders()
            .iter()
            .filter_map(|collider| self.collider_set.get(*collider))
            .map(|collider| {
                let aabb = collider.compute_aabb();
                let groups = collider.collision_groups();
                FixtureInfo {
                    min: Vec2::new(aabb.mins.x, aabb.mins.y),
                    max: Vec2::new(aabb.maxs.x, aabb.maxs.y),
                    filter: CollisionFilter {
                        memberships: groups.memberships.bits(),
                        filter: groups.filter.bits(),
                    },
                    density: collider.density(),
                    friction: collider.friction(),
                    area: collider.shape().mass_properties(1.0).mass(),
                }
            })
            .collect())
    }

    fn transform(&self, handle: BodyHandle) -> Option<(Vec2, f32)> {
        let entry = self.bodies.get(&handle)?;
        let body = self.rigid_body_set.get(entry.body)?;
        let translation = body.translation();
        Some((Vec2::new(translation.x, translation.y), body.rotation().angle()))
    }

    fn destroy(&mut self, handle: BodyHandle) {
        let Some(entry) = self.bodies.remove(&handle) else {
            return;
        };
        self.rigid_body_set.remove(
            entry.body,
            &mut self.island_manager,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            true,
        );
        log::debug!("[PHYSICS] Destroyed body {:?}", handle);
    }

    fn step(&mut self, dt: f32) {
        // Downward gravity in tiles/s^2
        let gravity = vector![0.0, -300.0];
        self.integration_parameters.dt = dt;

        self.pipeline.step(
            &gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(size: f32) -> Polygon {
        Polygon::new(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(size, 0.0),
            Vec2::new(size, size),
            Vec2::new(0.0, size),
        ])
    }

    #[test]
    fn test_create_and_query() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let body = bridge
            .create_body(BodyDesc::new(BodyKind::Static, Vec2::new(64.0, 0.0), vec![square(4.0)]))
            .unwrap();

        let fixtures = bridge.query_fixtures(body).unwrap();
        assert_eq!(fixtures.len(), 1);
        assert!((fixtures[0].min.x - 64.0).abs() < 1e-3);
        assert!((fixtures[0].max.y - 4.0).abs() < 1e-3);
    }

    #[test]
    fn test_body_without_shapes_is_rejected() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let result = bridge.create_body(BodyDesc::new(BodyKind::Dynamic, Vec2::ZERO, Vec::new()));
        assert!(matches!(result, Err(BridgeError::NoShape)));
    }

    #[test]
    fn test_update_hitbox_acknowledged() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let body = bridge
            .create_body(BodyDesc::new(BodyKind::Static, Vec2::ZERO, vec![square(2.0)]))
            .unwrap();

        let job = bridge
            .update_hitbox(body, vec![square(1.0), square(3.0).translated(Vec2::new(10.0, 0.0))])
            .unwrap();

        // Queries are ordered after the update
        assert_eq!(bridge.query_fixtures(body).unwrap().len(), 2);
        assert_eq!(bridge.poll_completions(), vec![job]);
    }

    #[test]
    fn test_set_filter() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let body = bridge
            .create_body(BodyDesc::new(BodyKind::Dynamic, Vec2::ZERO, vec![square(2.0)]))
            .unwrap();
        let filter = CollisionFilter {
            memberships: 0b01,
            filter: 0b10,
        };

        bridge.set_filter(body, filter).unwrap();
        let fixtures = bridge.query_fixtures(body).unwrap();
        assert_eq!(fixtures[0].filter, filter);
    }

    #[test]
    fn test_dynamic_body_falls() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let body = bridge
            .create_body(BodyDesc::new(BodyKind::Dynamic, Vec2::new(0.0, 100.0), vec![square(2.0)]))
            .unwrap();

        for _ in 0..10 {
            bridge.step(1.0 / 60.0).unwrap();
        }
        let (position, _angle) = bridge.body_transform(body).unwrap();
        assert!(position.y < 100.0);
    }

    #[test]
    fn test_mask_hitbox() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let mut mask = CollisionMask::new(4, 4);
        mask.set(0, 0, true);
        let body = bridge
            .create_body(BodyDesc::with_mask(BodyKind::Static, Vec2::ZERO, mask.clone()))
            .unwrap();
        assert_eq!(bridge.query_fixtures(body).unwrap().len(), 1);

        // Second, disjoint pixel
        mask.set(3, 3, true);
        bridge.update_hitbox_from_mask(body, Some(mask)).unwrap();
        assert_eq!(bridge.query_fixtures(body).unwrap().len(), 2);
    }

    #[test]
    fn test_concave_mask_keeps_its_notch() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        // 6x6 L of thickness 2: 20 pixels, hull would cover 28
        let mut mask = CollisionMask::new(6, 6);
        for i in 0..6 {
            for t in 0..2 {
                mask.set(i, t, true);
                mask.set(t, i, true);
            }
        }
        assert_eq!(mask.count(), 20);
        let body = bridge
            .create_body(BodyDesc::with_mask(BodyKind::Dynamic, Vec2::ZERO, mask))
            .unwrap();

        let fixtures = bridge.query_fixtures(body).unwrap();
        assert_eq!(fixtures.len(), 1);
        let area = fixtures[0].area;
        assert!(area > 16.0 && area < 24.0, "area {}", area);
    }

    #[test]
    fn test_destroyed_body_is_unknown() {
        let mut bridge = RigidBodyBridge::spawn().unwrap();
        let body = bridge
            .create_body(BodyDesc::new(BodyKind::Static, Vec2::ZERO, vec![square(1.0)]))
            .unwrap();

        bridge.destroy_body(body).unwrap();
        assert!(matches!(bridge.query_fixtures(body), Err(BridgeError::UnknownBody(_))));
    }
}

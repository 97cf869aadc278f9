//! Render-layer tagged subset of scene objects.
//!
//! The scene graph is external. A [`Selection`] only remembers opaque
//! [`ObjectHandle`]s and edits layer masks through [`SceneLayers`].

use std::collections::BTreeSet;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

bitflags! {
    /// 32 render layers, one bit each.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Layers: u32 {
        const DEFAULT = 1 << 0;
        const ALL = u32::MAX;
    }
}

impl Layers {
    pub fn layer(index: u8) -> Self {
        Layers::from_bits_retain(1u32 << (index % 32))
    }
}

/// Opaque handle into the external scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

/// Layer access the scene graph grants to selections.
pub trait SceneLayers {
    fn layers_mut(&mut self, object: ObjectHandle) -> Option<&mut Layers>;
}

/// Layer index that is always rendered by the main camera.
pub const ALWAYS_VISIBLE_LAYER: u8 = 0;

#[derive(Debug, Clone)]
pub struct Selection {
    objects: BTreeSet<ObjectHandle>,
    layer: u8,
    exclusive: bool,
}

impl Selection {
    /// `layer` is the dedicated bit members are tagged with. It must be one of
    /// the 32 layers and must not be [`ALWAYS_VISIBLE_LAYER`], which
    /// [`Selection::set_visible`] toggles independently.
    pub fn new(layer: u8) -> Result<Self> {
        if layer == ALWAYS_VISIBLE_LAYER || layer >= 32 {
            return Err(Error::configuration(
                "selection",
                format!("layer {layer} cannot tag a selection; use 1 to 31"),
            ));
        }
        Ok(Self {
            objects: BTreeSet::new(),
            layer,
            exclusive: false,
        })
    }

    pub fn layer(&self) -> u8 {
        self.layer
    }

    pub fn layer_mask(&self) -> Layers {
        Layers::layer(self.layer)
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    /// In exclusive mode, adding an object clears its other layer bits.
    pub fn set_exclusive(&mut self, exclusive: bool) {
        self.exclusive = exclusive;
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.objects.iter().copied()
    }

    pub fn has(&self, object: ObjectHandle) -> bool {
        self.objects.contains(&object)
    }

    /// Returns `false` if the scene does not know the object.
    pub fn add(&mut self, scene: &mut dyn SceneLayers, object: ObjectHandle) -> bool {
        let mask = self.layer_mask();
        let Some(layers) = scene.layers_mut(object) else {
            return false;
        };
        if self.exclusive {
            *layers = mask;
        } else {
            layers.insert(mask);
        }
        self.objects.insert(object);
        true
    }

    pub fn delete(&mut self, scene: &mut dyn SceneLayers, object: ObjectHandle) -> bool {
        if !self.objects.remove(&object) {
            return false;
        }
        if let Some(layers) = scene.layers_mut(object) {
            layers.remove(self.layer_mask());
        }
        true
    }

    pub fn clear(&mut self, scene: &mut dyn SceneLayers) {
        let mask = self.layer_mask();
        for object in std::mem::take(&mut self.objects) {
            if let Some(layers) = scene.layers_mut(object) {
                layers.remove(mask);
            }
        }
    }

    /// Toggles the always-rendered layer bit on every member.
    pub fn set_visible(&self, scene: &mut dyn SceneLayers, visible: bool) {
        let always = Layers::layer(ALWAYS_VISIBLE_LAYER);
        for object in &self.objects {
            if let Some(layers) = scene.layers_mut(*object) {
                layers.set(always, visible);
            }
        }
    }
}

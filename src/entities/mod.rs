pub mod cost_component;
pub mod cost_layer;
pub mod integrity_snapshot;
pub mod inventory_position;
pub mod layer_audit_entry;

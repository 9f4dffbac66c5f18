pub mod events;
pub mod filesystem;
pub mod memory;
pub mod nats;
pub mod postgres;
pub mod renderer;

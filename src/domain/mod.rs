// Queue, storage and rendering contracts live in `repository`; backends in
// `infrastructure` implement them. Scaling decisions in `scaling` are pure.

pub mod entity;
pub mod error;
pub mod event;
pub mod lease;
pub mod policy;
pub mod repository;
pub mod scaling;
pub mod validate;

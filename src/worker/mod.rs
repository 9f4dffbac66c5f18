pub mod pool;
pub mod render;

pub use pool::WorkerPool;
pub use render::RenderWorker;

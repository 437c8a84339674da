pub mod compositor;

pub use compositor::LiveCompositor;

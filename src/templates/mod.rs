mod render;

pub use render::{RenderErr, TemplateMode, render_application};

//! Content - template lookup and `{{key}}` substitution

mod resolver;

pub use resolver::{
    merge_variables, render_template, ContentResolver, ContentSource, RenderContext,
    RenderedContent, TemplateRef,
};

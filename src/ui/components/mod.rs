mod header;

pub use header::render_header;

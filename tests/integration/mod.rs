pub mod audio;
pub mod editor;
pub mod session;

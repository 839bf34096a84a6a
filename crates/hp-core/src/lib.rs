//! Building blocks of the hostpanel orchestration engine: the shell
//! boundary, service control, config rendering, the data model and the
//! persistence seams.

pub mod fs;
pub mod layout;
pub mod model;
pub mod render;
pub mod security;
pub mod service;
pub mod settings;
pub mod shell;
pub mod store;

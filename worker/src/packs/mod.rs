//! Built-in packs. Real business packs register here the same way.

mod echo;

pub use echo::EchoPack;

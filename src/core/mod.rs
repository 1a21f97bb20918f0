pub mod context;
pub mod db;
pub mod eval;
pub mod grammar;
pub mod jinja;
pub mod markov;
pub mod seeds;
pub mod storage;
pub mod story;
pub mod template;
pub mod text;

pub mod id;
pub mod run;

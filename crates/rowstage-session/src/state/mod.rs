pub mod guard;
pub mod machine;

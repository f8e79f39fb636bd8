pub mod command;
pub mod fastx;
pub mod file;
pub mod rescore;
pub mod sambam;
pub mod stage;
pub mod streams;
pub mod system;
pub mod triage;
pub mod trim;

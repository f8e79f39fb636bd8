pub mod triage_align;

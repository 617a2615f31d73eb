//! Identifier helpers.
//!
//! The teacher (`upload.rs`) reuses a caller-supplied `task_id` string as
//! session identity. This spec requires the engine itself to assign
//! session identity (§3), so we generate opaque ids instead — grounded on
//! `dog-blob`/`dog-queue`'s use of `uuid` for exactly this role.

use uuid::Uuid;

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Composite primary key for a part: `{session_id}:{part_number}` (§3).
pub fn part_id(session_id: &str, part_number: u32) -> String {
    format!("{session_id}:{part_number}")
}

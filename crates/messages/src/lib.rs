//! Messages exchanged by a reconnect teacher and learner.
//!
//! A session is a strict request/response exchange driven by the teacher:
//!
//! ```text
//! Teacher                                   Learner
//! │ ── Handshake (tree shape, root) ─────────► │
//! │ ◄── HandshakeAck ───────────────────────── │
//! │ ── Lessons (queries, leaves) ────────────► │ compare with old tree
//! │ ◄── Answers (mismatched paths) ────────── │
//! │    ...until no mismatch is left...         │
//! │ ── Complete ─────────────────────────────► │
//! │ ◄── CompleteAck ────────────────────────── │
//! ```
//!
//! Either side may send `Abort` instead of its next message.

pub mod learner;
pub mod teacher;

pub use learner::{Answers, LearnerMessage};
pub use teacher::{Handshake, Lessons, TeacherMessage};

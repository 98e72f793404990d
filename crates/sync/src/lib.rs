//! Reconnect: bringing a lagging node's tree up to date from a peer.
//!
//! The [`Teacher`] walks its sealed version from the root and offers node
//! hashes; the [`Learner`] compares each against its own last version and
//! asks only for subtrees that differ. Matching subtrees are never sent, so
//! two identical trees exchange a single root hash. The learner builds the
//! result in a fork of its data source, and the [`ReconnectNodeRemover`]
//! deletes leaves the teacher no longer has.
//!
//! Sessions run over any `AsyncRead + AsyncWrite` stream using the frames in
//! [`codec`].

pub mod codec;
mod config;
mod error;
mod learner;
mod remover;
mod session;
mod stats;
mod teacher;
mod view;

pub use codec::{CodecError, FramedStream};
pub use config::ReconnectConfig;
pub use error::{ReconnectError, Result};
pub use learner::{Learner, Reconnected};
pub use remover::ReconnectNodeRemover;
pub use stats::ReconnectStats;
pub use teacher::Teacher;
pub use view::{NodeKind, TreeView};

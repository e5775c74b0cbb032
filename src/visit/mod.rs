//! Peephole rewrite rules that hook into [`crate::state::State::run`].
//!
//! `pre` fires on an element pair before either has been interpreted, so
//! the driver re-dispatches whatever the rewrite leaves behind. `post`
//! fires on an element already interpreted (its abstract effect already
//! landed) paired with its not-yet-interpreted successor.

pub mod post;
pub mod pre;

pub use post::post_interp;
pub use pre::pre_interp;

//! Lock-free ordered containers with safe memory reclamation.
//!
//! The heart of the crate is a pair of sorted linked lists implementing
//! Michael's lock-free list algorithm, differing only in how they keep
//! removed nodes alive for threads that may still be reading them:
//!
//! - [`List`] uses hazard pointers: traversals publish the addresses they
//!   dereference in a [`Domain`], and retired nodes are freed once no slot
//!   publishes them.
//! - [`RcuList`] uses epoch-based RCU: traversals run inside a read-side
//!   critical section ([`rcu::read_lock`]) and retired nodes wait out a
//!   grace period ([`rcu::synchronize`]).
//!
//! [`HashMap`] and [`HashSet`] shard a fixed array of such lists to keep
//! chains short. All structural mutation is a compare-and-swap on either a
//! list head or a node's `next` pointer — there is no mutex anywhere on an
//! operation's path.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use quiesce::HashMap;
//!
//! let map = Arc::new(HashMap::new());
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 map.insert(t * 100 + i, t);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(map.len(), 400);
//! ```
//!
//! [`List`]: struct.List.html
//! [`RcuList`]: struct.RcuList.html
//! [`Domain`]: struct.Domain.html
//! [`HashMap`]: struct.HashMap.html
//! [`HashSet`]: struct.HashSet.html
//! [`rcu::read_lock`]: rcu/fn.read_lock.html
//! [`rcu::synchronize`]: rcu/fn.synchronize.html

#![warn(missing_docs)]

mod atomic;
mod backoff;
mod counter;
mod garbage;
mod list;
mod map;
mod set;

pub mod hazard;
pub mod rcu;

pub use crate::atomic::{Atomic, Owned, Protection, Shared};
pub use crate::backoff::Backoff;
pub use crate::hazard::{Domain, Guards};
pub use crate::list::{DeadlockCheck, Extracted, Iter, List, RcuIter, RcuList};
pub use crate::map::HashMap;
pub use crate::set::HashSet;

//! Small constructor for the unbounded mpsc channel used to carry
//! [`crate::connection::Delivery`] from every per-connection reader task
//! to the router in [`crate::Partisan::start`].

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub struct Mailbox<T> {
  tx: UnboundedSender<T>,
  rx: UnboundedReceiver<T>,
}

impl<T> Mailbox<T> {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn split(self) -> (UnboundedSender<T>, UnboundedReceiver<T>) {
    (self.tx, self.rx)
  }
}

impl<T> Default for Mailbox<T> {
  fn default() -> Self {
    Self::new()
  }
}

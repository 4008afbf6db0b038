//! Bounded drop-oldest buffer for notifications the app has not
//! subscribed to yet.

use std::{collections::VecDeque, mem};

use crate::event::Packet;

#[derive(Debug)]
pub struct NotifyBuffer {
   capacity: usize,
   items: VecDeque<Packet>,
}

impl NotifyBuffer {
   pub fn new(capacity: usize) -> Self {
      Self {
         capacity,
         items: VecDeque::with_capacity(capacity.min(1024)),
      }
   }

   pub const fn capacity(&self) -> usize {
      self.capacity
   }

   pub fn len(&self) -> usize {
      self.items.len()
   }

   pub fn is_empty(&self) -> bool {
      self.items.is_empty()
   }

   /// Appends a payload and returns the entry evicted to make room, if any.
   pub fn push(&mut self, packet: Packet) -> Option<Packet> {
      if self.capacity == 0 {
         return Some(packet);
      }
      let evicted = if self.items.len() >= self.capacity {
         self.items.pop_front()
      } else {
         None
      };
      self.items.push_back(packet);
      evicted
   }

   /// Takes every buffered payload in arrival order, leaving it empty.
   pub fn take(&mut self) -> VecDeque<Packet> {
      mem::take(&mut self.items)
   }

   /// Puts payloads that are older than everything buffered back in front.
   /// Returns how many of the oldest entries had to be evicted.
   pub fn restore_front<I>(&mut self, older: I) -> usize
   where
      I: IntoIterator<Item = Packet>,
      I::IntoIter: DoubleEndedIterator,
   {
      for packet in older.into_iter().rev() {
         self.items.push_front(packet);
      }
      let mut evicted = 0;
      while self.items.len() > self.capacity {
         self.items.pop_front();
         evicted += 1;
      }
      evicted
   }

   #[cfg(test)]
   pub fn iter(&self) -> impl ExactSizeIterator<Item = &Packet> {
      self.items.iter()
   }
}

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tracing::warn;

use crate::{cell::Cell, config::DriverConfig, status::Status};

/// A fixed set of cells served round-robin. No load-aware routing: an atomic
/// counter picks the next cell and wraps.
pub struct Pool {
    cells: Vec<Cell>,
    next: AtomicUsize,
}

impl Pool {
    pub fn new(config: DriverConfig) -> Self {
        let count = config.cells.max(1);
        let config = Arc::new(config);
        let cells = (0..count).map(|i| Cell::new(config.clone(), i as u64)).collect();
        Self { cells, next: AtomicUsize::new(0) }
    }

    /// Start every cell eagerly. Fails only when no cell comes up; partial
    /// pools keep running on the survivors.
    pub fn start(&mut self) -> Status {
        let mut last = Status::OK;
        let mut live = 0;
        for cell in &mut self.cells {
            let status = cell.start();
            if status.is_ok() {
                live += 1;
            } else {
                warn!(cell = cell.client_id(), %status, "cell failed to start");
                last = status;
            }
        }
        if live == 0 { last } else { Status::OK }
    }

    /// Start a single cell, for lazy warm-up.
    pub fn start_cell(&mut self, index: usize) -> Status {
        match self.cells.get_mut(index) {
            Some(cell) => cell.start(),
            None => Status::OK,
        }
    }

    pub fn stop(&mut self) {
        for cell in &mut self.cells {
            cell.stop();
        }
    }

    /// Round-robin pick.
    pub fn acquire(&self) -> &Cell {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.cells.len();
        &self.cells[i]
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Cell> {
        self.cells.get_mut(index)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_round_robins() {
        let pool = Pool::new(DriverConfig { cells: 3, ..DriverConfig::default() });
        let ids: Vec<u64> = (0..6).map(|_| pool.acquire().client_id()).collect();
        assert_eq!(ids, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn at_least_one_cell() {
        let pool = Pool::new(DriverConfig { cells: 0, ..DriverConfig::default() });
        assert_eq!(pool.len(), 1);
    }
}

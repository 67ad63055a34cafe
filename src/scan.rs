//! Log-order iteration.
//!
//! A pull iterator over `[begin, end)` logical addresses. Records still in
//! memory are read under epoch protection; records below the head come
//! from the device, staged a page at a time according to the buffering
//! mode. The end bound is fixed at creation, so records appended after
//! the iterator was built are never returned.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::address::Address;
use crate::common::Result;
use crate::device::read_blocking;
use crate::hlog::HybridLog;
use crate::record::{RecordInfo, RecordView};

/// How disk-resident pages are staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    /// Walk in-memory records only; the on-disk prefix is skipped.
    NoBuffering,
    /// Stage one device page at a time.
    SinglePageBuffering,
    /// Stage the current page and prefetch the next.
    DoublePageBuffering,
}

impl BufferingMode {
    fn capacity(&self) -> usize {
        match self {
            BufferingMode::NoBuffering => 0,
            BufferingMode::SinglePageBuffering => 1,
            BufferingMode::DoublePageBuffering => 2,
        }
    }
}

/// One record yielded by the iterator.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub info: RecordInfo,
    pub tag: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expiration: Option<u64>,
    pub address: Address,
    /// Where iteration continues after this record.
    pub next_address: Address,
}

/// Pull iterator over the record log.
pub struct LogIterator {
    hlog: Arc<HybridLog>,
    mode: BufferingMode,
    current: Address,
    end: Address,
    pages: VecDeque<(u64, Vec<u8>)>,
}

impl LogIterator {
    /// Iterates `[begin, end)`; both bounds are clamped to the log.
    pub fn new(hlog: Arc<HybridLog>, mode: BufferingMode, begin: Address, end: Address) -> Self {
        let begin = begin.max(hlog.begin_address());
        let end = end.min(hlog.tail_address());
        Self {
            hlog,
            mode,
            current: begin,
            end,
            pages: VecDeque::new(),
        }
    }

    /// Iterates the whole log up to the tail at this moment.
    pub fn over_log(hlog: Arc<HybridLog>, mode: BufferingMode) -> Self {
        let begin = hlog.begin_address();
        let end = hlog.tail_address();
        Self::new(hlog, mode, begin, end)
    }

    /// Restarts from a logical address (>= the log's begin address).
    pub fn seek(&mut self, address: Address) {
        self.current = address.max(self.hlog.begin_address());
    }

    pub fn current_address(&self) -> Address {
        self.current
    }

    fn advance_to_next_page(&mut self) {
        let geometry = *self.hlog.geometry();
        let page = geometry.page(self.current);
        self.current = geometry.page_start(page + 1);
    }

    fn staged_page(&mut self, page: u64) -> Result<&[u8]> {
        if !self.pages.iter().any(|(p, _)| *p == page) {
            self.stage(page)?;
            if self.mode == BufferingMode::DoublePageBuffering {
                let geometry = *self.hlog.geometry();
                let next = page + 1;
                if geometry.page_start(next) < self.end
                    && geometry.page_start(next) < self.hlog.head_address()
                {
                    self.stage(next)?;
                }
            }
        }
        Ok(&self.pages.iter().find(|(p, _)| *p == page).unwrap().1)
    }

    fn stage(&mut self, page: u64) -> Result<()> {
        let geometry = *self.hlog.geometry();
        let start = geometry.page_start(page);
        let bytes = read_blocking(
            self.hlog.device().as_ref(),
            start.control(),
            geometry.page_size(),
        )?;
        while self.pages.len() >= self.mode.capacity().max(1) {
            self.pages.pop_front();
        }
        self.pages.push_back((page, bytes));
        log::trace!("scan staged page {}", page);
        Ok(())
    }

    /// Next record in log order. Fillers are consumed silently; sealed
    /// records are skipped; tombstones are yielded for the caller to
    /// interpret.
    pub fn next_entry(&mut self) -> Result<Option<ScanEntry>> {
        loop {
            if self.current >= self.end {
                return Ok(None);
            }
            let geometry = *self.hlog.geometry();
            let head = self.hlog.head_address();

            let parsed = if self.current < head {
                if self.mode == BufferingMode::NoBuffering {
                    // Skip the on-disk prefix entirely.
                    self.current = head.max(self.current);
                    if self.current >= self.end {
                        return Ok(None);
                    }
                    continue;
                }
                let page = geometry.page(self.current);
                let offset = geometry.offset(self.current) as usize;
                let current = self.current;
                let bytes = self.staged_page(page)?;
                match RecordView::parse(&bytes[offset..])? {
                    None => None,
                    Some(view) => Some(entry_from(&view, current)),
                }
            } else {
                let guard = self.hlog.epoch().enter();
                match self.hlog.page_tail_slice(self.current, &guard) {
                    // The frame slipped out of memory between the head
                    // check and the access; retry via the device path.
                    None => continue,
                    Some(slice) => match RecordView::parse(slice)? {
                        None => None,
                        Some(view) => Some(entry_from(&view, self.current)),
                    },
                }
            };

            match parsed {
                None => {
                    // Unwritten space: nothing else was published in this
                    // page, move to the next one.
                    self.advance_to_next_page();
                }
                Some(entry) => {
                    if entry.info.filler() {
                        self.advance_to_next_page();
                        continue;
                    }
                    self.current = entry.next_address;
                    if entry.info.sealed() {
                        continue;
                    }
                    return Ok(Some(entry));
                }
            }
        }
    }
}

fn entry_from(view: &RecordView<'_>, address: Address) -> ScanEntry {
    ScanEntry {
        info: view.info,
        tag: view.tag,
        key: view.key.to_vec(),
        value: view.value.to_vec(),
        expiration: view.expiration,
        address,
        next_address: address + view.len as u64,
    }
}

impl Iterator for LogIterator {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

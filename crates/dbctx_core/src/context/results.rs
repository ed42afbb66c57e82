//! Result containers handed back by the context.

use crate::db::{DbError, DbResult, FromRow, Row};
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Single-pass sequence of projected rows.
///
/// Rows are already fetched; projection into `T` happens as the iterator is
/// advanced, so a mapping failure only surfaces for the row that caused it.
/// Run the query again to restart.
pub struct QueryIter<T> {
    rows: std::vec::IntoIter<Row>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromRow> QueryIter<T> {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
            _marker: PhantomData,
        }
    }

    /// Collects every row, stopping at the first mapping failure.
    pub fn collect_all(self) -> DbResult<Vec<T>> {
        self.collect()
    }

    /// Exactly one row, like a scalar `SELECT`.
    pub fn single(mut self) -> DbResult<T> {
        let first = self
            .next()
            .ok_or_else(|| DbError::Mapping("query returned no rows".to_string()))??;
        if self.rows.next().is_some() {
            return Err(DbError::Mapping(
                "query returned more than one row".to_string(),
            ));
        }
        Ok(first)
    }
}

impl<T: FromRow> Iterator for QueryIter<T> {
    type Item = DbResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(|row| T::from_row(&row))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

/// Result sets of a multi-statement command, consumed front to back.
#[derive(Debug)]
pub struct GridReader {
    sets: VecDeque<Vec<Row>>,
}

impl GridReader {
    pub(crate) fn new(sets: Vec<Vec<Row>>) -> Self {
        Self { sets: sets.into() }
    }

    /// Reads the next result set.
    ///
    /// # Errors
    /// - `DbError::InvalidState` once every set has been read.
    pub fn read<T: FromRow>(&mut self) -> DbResult<QueryIter<T>> {
        let rows = self.sets.pop_front().ok_or_else(|| {
            DbError::InvalidState("all result sets have already been consumed".to_string())
        })?;
        Ok(QueryIter::new(rows))
    }

    /// Reads the next result set and returns its first row, if any.
    pub fn read_first<T: FromRow>(&mut self) -> DbResult<Option<T>> {
        self.read::<T>()?.next().transpose()
    }

    pub fn remaining(&self) -> usize {
        self.sets.len()
    }

    pub fn is_consumed(&self) -> bool {
        self.sets.is_empty()
    }
}

//! Ordering and windowing of already-filtered rows.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

use schema::Value;

use crate::eval::{field_value, project};
use crate::statement::{Direction, OrderBy, Record, Window};

/// A row together with its precomputed sort keys.
#[derive(Debug, Clone)]
pub struct Keyed {
    pub keys: Vec<Value>,
    pub row: Record,
}

/// Stable multi-key sort.
pub fn sort(rows: &mut [Keyed], order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| compare_keys(&a.keys, &b.keys, order));
}

/// Compare two key vectors under `order`; NULL placement follows each entry.
pub fn compare_keys(a: &[Value], b: &[Value], order: &[OrderBy]) -> Ordering {
    for ((x, y), entry) in a.iter().zip(b).zip(order) {
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if entry.nulls_first() => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if entry.nulls_first() => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let natural = x.compare(y).unwrap_or(Ordering::Equal);
                match entry.direction {
                    Direction::Asc => natural,
                    Direction::Desc => natural.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Apply distinct, cursor, skip and take to sorted rows, per partition.
pub fn apply(rows: Vec<Record>, window: &Window) -> Vec<Record> {
    if window.partition.is_empty() {
        return select(rows, window);
    }
    let mut groups: Vec<Vec<Record>> = Vec::new();
    let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
    for row in rows {
        let key = project(&row, &window.partition);
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(row);
    }
    groups.into_iter().flat_map(|group| select(group, window)).collect()
}

fn select(rows: Vec<Record>, window: &Window) -> Vec<Record> {
    let rows = distinct(rows, &window.distinct);
    let anchor = match &window.cursor {
        None => None,
        Some(cursor) => {
            let found = rows
                .iter()
                .position(|row| cursor.iter().all(|(field, value)| field_value(row, field) == value));
            match found {
                Some(position) => Some(position),
                None => return Vec::new(),
            }
        }
    };
    let range = slice(rows.len(), anchor, window.skip, window.take);
    rows.into_iter().skip(range.start).take(range.len()).collect()
}

fn distinct(rows: Vec<Record>, fields: &[String]) -> Vec<Record> {
    if fields.is_empty() {
        return rows;
    }
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(project(row, fields)))
        .collect()
}

/// Index range selected from `len` sorted items.
///
/// `anchor` is the cursor position. A positive (or absent) `take` reads
/// forward from the anchor, a negative one reads the rows ending at it.
/// `skip` moves away from the anchor in the direction of `take`.
pub fn slice(len: usize, anchor: Option<usize>, skip: u64, take: Option<i64>) -> Range<usize> {
    let skip = usize::try_from(skip).unwrap_or(usize::MAX);
    match take {
        Some(take) if take < 0 => {
            let count = usize::try_from(take.unsigned_abs()).unwrap_or(usize::MAX);
            let end = anchor.map_or(len, |i| i + 1).saturating_sub(skip);
            end.saturating_sub(count)..end
        }
        _ => {
            let start = anchor.unwrap_or(0).saturating_add(skip).min(len);
            let end = match take {
                Some(take) => start
                    .saturating_add(usize::try_from(take).unwrap_or(usize::MAX))
                    .min(len),
                None => len,
            };
            start..end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[i64]) -> Vec<Record> {
        ids.iter()
            .map(|id| Record::from([("id".to_string(), Value::Int(*id))]))
            .collect()
    }

    fn ids(rows: &[Record]) -> Vec<i64> {
        rows.iter()
            .map(|r| match r["id"] {
                Value::Int(i) => i,
                _ => unreachable!(),
            })
            .collect()
    }

    fn cursor(id: i64) -> Option<Record> {
        Some(Record::from([("id".to_string(), Value::Int(id))]))
    }

    #[test]
    fn slice_without_cursor() {
        assert_eq!(slice(5, None, 1, Some(2)), 1..3);
        assert_eq!(slice(5, None, 0, Some(-2)), 3..5);
        assert_eq!(slice(5, None, 1, Some(-2)), 2..4);
        assert_eq!(slice(5, None, 0, Some(0)), 0..0);
        assert_eq!(slice(5, None, 9, None), 5..5);
    }

    #[test]
    fn cursor_is_inclusive() {
        let window = Window {
            cursor: cursor(3),
            take: Some(2),
            ..Window::default()
        };
        assert_eq!(ids(&apply(rows(&[1, 2, 3, 4, 5]), &window)), vec![3, 4]);
    }

    #[test]
    fn skip_one_excludes_the_cursor() {
        let window = Window {
            cursor: cursor(3),
            skip: 1,
            take: Some(2),
            ..Window::default()
        };
        assert_eq!(ids(&apply(rows(&[1, 2, 3, 4, 5]), &window)), vec![4, 5]);
    }

    #[test]
    fn negative_take_reads_backwards_from_the_cursor() {
        let window = Window {
            cursor: cursor(3),
            take: Some(-2),
            ..Window::default()
        };
        assert_eq!(ids(&apply(rows(&[1, 2, 3, 4, 5]), &window)), vec![2, 3]);

        let skipping = Window {
            skip: 1,
            ..window
        };
        assert_eq!(ids(&apply(rows(&[1, 2, 3, 4, 5]), &skipping)), vec![1, 2]);
    }

    #[test]
    fn missing_cursor_row_yields_nothing() {
        let window = Window {
            cursor: cursor(42),
            ..Window::default()
        };
        assert!(apply(rows(&[1, 2, 3]), &window).is_empty());
    }

    #[test]
    fn windows_apply_per_partition() {
        let mut data = Vec::new();
        for (owner, id) in [(1, 10), (2, 20), (1, 11), (2, 21), (1, 12)] {
            data.push(Record::from([
                ("owner".to_string(), Value::Int(owner)),
                ("id".to_string(), Value::Int(id)),
            ]));
        }
        let window = Window {
            take: Some(2),
            partition: vec!["owner".into()],
            ..Window::default()
        };
        assert_eq!(ids(&apply(data, &window)), vec![10, 11, 20, 21]);
    }

    #[test]
    fn nulls_sort_greatest_by_default() {
        let order = [OrderBy::asc("x")];
        assert_eq!(compare_keys(&[Value::Null], &[Value::Int(1)], &order), Ordering::Greater);
        let desc = [OrderBy {
            direction: Direction::Desc,
            ..OrderBy::asc("x")
        }];
        assert_eq!(compare_keys(&[Value::Null], &[Value::Int(1)], &desc), Ordering::Less);
    }
}

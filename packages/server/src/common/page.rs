//! Cursor pagination for descending-id listings.
//!
//! The cursor is simply the last seen row id; a page is fetched as
//! `WHERE id < cursor ORDER BY id DESC LIMIT n+1`, with the extra row
//! deciding `has_more`.

use serde::Serialize;

/// One page of a descending-id listing.
#[derive(Debug, Clone, Serialize)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl<T> CursorPage<T> {
    /// Build a page from `limit + 1` fetched rows.
    ///
    /// `id_of` extracts the row id used as the next cursor.
    pub fn from_rows(mut rows: Vec<T>, limit: usize, id_of: impl Fn(&T) -> i64) -> Self {
        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }
        let next_cursor = if has_more {
            rows.last().map(|row| id_of(row).to_string())
        } else {
            None
        };
        Self {
            items: rows,
            has_more,
            next_cursor,
        }
    }
}

/// Parse a client-supplied cursor. Invalid cursors read as "no cursor".
pub fn parse_cursor(cursor: Option<&str>) -> Option<i64> {
    cursor?.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_trims_and_sets_cursor() {
        let rows = vec![9i64, 8, 7, 6];
        let page = CursorPage::from_rows(rows, 3, |id| *id);
        assert!(page.has_more);
        assert_eq!(page.items, vec![9, 8, 7]);
        assert_eq!(page.next_cursor.as_deref(), Some("7"));
    }

    #[test]
    fn test_exact_page_has_no_cursor() {
        let page = CursorPage::from_rows(vec![3i64, 2, 1], 3, |id| *id);
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_parse_cursor_rejects_garbage() {
        assert_eq!(parse_cursor(Some("42")), Some(42));
        assert_eq!(parse_cursor(Some("abc")), None);
        assert_eq!(parse_cursor(Some("-1")), None);
        assert_eq!(parse_cursor(None), None);
    }
}

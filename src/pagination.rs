use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

/// Page window resolved from the `page` / `per_page` query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: i64,
    pub per_page: i64,
}

impl PageParams {
    pub fn new(page: Option<i64>, per_page: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }

    pub fn limit(&self) -> i64 {
        self.per_page
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct PageMeta {
    pub total: i64,
    pub per_page: i64,
    pub current_page: i64,
    pub last_page: i64,
}

impl PageMeta {
    pub fn new(total: i64, params: PageParams) -> Self {
        let last_page = ((total + params.per_page - 1) / params.per_page).max(1);
        Self {
            total,
            per_page: params.per_page,
            current_page: params.page,
            last_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_clamping() {
        assert_eq!(PageParams::new(None, None), PageParams { page: 1, per_page: 20 });
        assert_eq!(PageParams::new(Some(0), Some(500)).per_page, MAX_PER_PAGE);
        assert_eq!(PageParams::new(Some(-3), Some(0)), PageParams { page: 1, per_page: 1 });
        assert_eq!(PageParams::new(Some(3), Some(10)).offset(), 20);
    }

    #[test]
    fn last_page_rounds_up_and_never_drops_below_one() {
        let params = PageParams::new(Some(2), Some(20));
        assert_eq!(PageMeta::new(0, params).last_page, 1);
        assert_eq!(PageMeta::new(20, params).last_page, 1);
        assert_eq!(PageMeta::new(21, params).last_page, 2);
        let meta = PageMeta::new(45, params);
        assert_eq!(meta.last_page, 3);
        assert_eq!(meta.current_page, 2);
        assert_eq!(meta.per_page, 20);
    }
}

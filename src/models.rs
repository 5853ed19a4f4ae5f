use serde::Serialize;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_DONE: &str = "done";
pub const STATUS_CANCELLED: &str = "cancelled";

pub const DISCOUNT_PERCENT: &str = "percent";
pub const DISCOUNT_AMOUNT: &str = "amount";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookingRow {
    pub id: String,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub booking_date: String,
    pub start_time: String,
    pub duration_minutes: i64,
    pub service_id: Option<i64>,
    pub manual_service: Option<String>,
    pub discount: i64,
    pub final_price: i64,
    pub status: String,
    pub is_notified: i64,
    pub created_at: String,
    pub service_name: Option<String>,
}

impl BookingRow {
    pub fn service_label(&self) -> String {
        self.manual_service
            .clone()
            .filter(|label| !label.trim().is_empty())
            .or_else(|| self.service_name.clone())
            .unwrap_or_else(|| "-".to_string())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceRow {
    pub id: i64,
    pub name: String,
    pub price: i64,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InventoryItemRow {
    pub id: i64,
    pub name: String,
    pub quantity: i64,
    pub unit: String,
    pub min_level: i64,
}

impl InventoryItemRow {
    pub fn low_stock(&self) -> bool {
        self.quantity <= self.min_level
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RecipeEntryRow {
    pub id: i64,
    pub service_id: i64,
    pub inventory_id: i64,
    pub quantity_used: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PromotionRow {
    pub id: i64,
    pub name: String,
    pub discount_type: String,
    pub value: i64,
    pub is_active: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CustomerRow {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub facebook: Option<String>,
    pub visit_count: i64,
    pub total_spent: i64,
    pub last_visit: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActivityRow {
    pub message: String,
    pub created_at: String,
}

// A booking names its service either by catalog reference or as free text
// with an explicit price and duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    Catalog {
        id: i64,
    },
    Manual {
        label: String,
        price: i64,
        duration_minutes: i64,
    },
}

// Inactive promotions never discount anything; unknown types count as zero.
pub fn promotion_discount(price: i64, promo: &PromotionRow) -> i64 {
    if promo.is_active == 0 {
        return 0;
    }
    let discount = match promo.discount_type.as_str() {
        DISCOUNT_PERCENT => price * promo.value / 100,
        DISCOUNT_AMOUNT => promo.value,
        _ => 0,
    };
    discount.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promo(discount_type: &str, value: i64, active: bool) -> PromotionRow {
        PromotionRow {
            id: 1,
            name: "test".to_string(),
            discount_type: discount_type.to_string(),
            value,
            is_active: if active { 1 } else { 0 },
        }
    }

    #[test]
    fn percent_discount() {
        assert_eq!(promotion_discount(450, &promo(DISCOUNT_PERCENT, 20, true)), 90);
        assert_eq!(promotion_discount(99, &promo(DISCOUNT_PERCENT, 10, true)), 9);
    }

    #[test]
    fn amount_discount() {
        assert_eq!(promotion_discount(450, &promo(DISCOUNT_AMOUNT, 100, true)), 100);
    }

    #[test]
    fn inactive_promotion_has_no_effect() {
        assert_eq!(promotion_discount(450, &promo(DISCOUNT_PERCENT, 20, false)), 0);
    }

    #[test]
    fn unknown_type_counts_as_zero() {
        assert_eq!(promotion_discount(450, &promo("mystery", 20, true)), 0);
    }

    #[test]
    fn negative_value_clamped() {
        assert_eq!(promotion_discount(450, &promo(DISCOUNT_AMOUNT, -50, true)), 0);
    }

    #[test]
    fn booking_label_prefers_manual_text() {
        let mut row = BookingRow {
            id: "b1".to_string(),
            customer_name: "Mai".to_string(),
            customer_phone: None,
            booking_date: "2024-06-01".to_string(),
            start_time: "15:30".to_string(),
            duration_minutes: 60,
            service_id: None,
            manual_service: Some("Gel + PVC extension".to_string()),
            discount: 0,
            final_price: 700,
            status: STATUS_PENDING.to_string(),
            is_notified: 0,
            created_at: String::new(),
            service_name: Some("Gel Polish".to_string()),
        };
        assert_eq!(row.service_label(), "Gel + PVC extension");
        row.manual_service = None;
        assert_eq!(row.service_label(), "Gel Polish");
        row.service_name = None;
        assert_eq!(row.service_label(), "-");
    }
}

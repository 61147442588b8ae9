diesel::table! {
    products (product_id) {
        product_id -> Uuid,
        stock -> Int4,
        reserved_stock -> Int4,
        available_stock -> Int4,
        version -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        product_id -> Uuid,
        order_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_records (id) {
        id -> Uuid,
        product_id -> Uuid,
        order_id -> Nullable<Uuid>,
        record_type -> Varchar,
        quantity -> Int4,
        before_stock -> Int4,
        after_stock -> Int4,
        before_available -> Int4,
        after_available -> Int4,
        version -> Int8,
        reason -> Text,
        operator_id -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    products,
    reservations,
    stock_records,
);

diesel::table! {
    vehicles (id) {
        id -> Uuid,
        license_plate -> Varchar,
        driver_name -> Varchar,
        driver_phone -> Nullable<Varchar>,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    routes (id) {
        id -> Uuid,
        vehicle_id -> Uuid,
        route_date -> Date,
        status -> Varchar,
        estimated_duration_minutes -> Int4,
        total_distance_km -> Numeric,
        total_orders -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    shipments (id) {
        id -> Uuid,
        order_id -> Uuid,
        customer_id -> Uuid,
        delivery_address -> Varchar,
        delivery_city -> Varchar,
        delivery_country -> Varchar,
        latitude -> Nullable<Numeric>,
        longitude -> Nullable<Numeric>,
        geocoding_status -> Varchar,
        route_id -> Nullable<Uuid>,
        sequence_in_route -> Nullable<Int4>,
        order_timestamp -> Timestamptz,
        target_date -> Date,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_events (id) {
        id -> Uuid,
        event_id -> Varchar,
        event_type -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::joinable!(routes -> vehicles (vehicle_id));
diesel::joinable!(shipments -> routes (route_id));

diesel::allow_tables_to_appear_in_same_query!(
    vehicles,
    routes,
    shipments,
    processed_events,
);

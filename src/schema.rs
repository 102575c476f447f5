// Hand-maintained to match migrations/; SQL names follow the tables read by the query service.

diesel::table! {
    #[sql_name = "Raw_State"]
    raw_state (ts, measurement_label) {
        #[sql_name = "timestamp"]
        ts -> Text,
        #[sql_name = "measurementLabel"]
        measurement_label -> Text,
        state -> Double,
    }
}

diesel::table! {
    #[sql_name = "MIM"]
    label_catalog (measurement_label) {
        #[sql_name = "measurementLabel"]
        measurement_label -> Text,
        #[sql_name = "measurementType"]
        measurement_type -> Nullable<Text>,
        #[sql_name = "zoneName"]
        zone_name -> Nullable<Text>,
        #[sql_name = "deviceFriendlyName"]
        device_friendly_name -> Nullable<Text>,
    }
}

diesel::table! {
    #[sql_name = "AIM"]
    device_catalog (device_friendly_name) {
        #[sql_name = "deviceFriendlyName"]
        device_friendly_name -> Text,
        building -> Nullable<Text>,
        floor -> Nullable<Text>,
        room -> Nullable<Text>,
        #[sql_name = "deviceClass"]
        device_class -> Nullable<Text>,
        #[sql_name = "macAddress"]
        mac_address -> Nullable<Text>,
        #[sql_name = "ipAddress"]
        ip_address -> Nullable<Text>,
    }
}

diesel::table! {
    sync_checkpoint (source) {
        source -> Text,
        last_ts -> Text,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(raw_state, label_catalog, device_catalog, sync_checkpoint);

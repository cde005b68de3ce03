use actix_web::{test, web, App};
use async_trait::async_trait;
use devflow_core::{DevicePool, DeviceRunner, ValueStorage};
use devflow_sdk::{
    DeviceContext, DeviceSettings, Driver, NumberMeta, Register, RunFailure, Value, ValuePayload,
};
use devflow_config::{ViewDeviceSection, ViewSection};
use devflow_web::{configure_api, AppState};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tokio_util::sync::CancellationToken;

struct StubDriver {
    context: Arc<DeviceContext>,
    registers: Vec<Register>,
}

#[async_trait]
impl Driver for StubDriver {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn model(&self) -> String {
        "stub".into()
    }

    fn registers(&self) -> Vec<Register> {
        self.registers.clone()
    }

    fn get_register(&self, name: &str) -> Option<Register> {
        self.registers.iter().find(|r| r.name() == name).cloned()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), RunFailure> {
        cancel.cancelled().await;
        Ok(())
    }
}

struct Fixture {
    state: Arc<AppState>,
    storage: Arc<ValueStorage>,
    command_storage: Arc<ValueStorage>,
}

fn fixture() -> Fixture {
    let device: Arc<str> = Arc::from("dev0");
    let mut relay_map = BTreeMap::new();
    relay_map.insert(0, "open".to_string());
    relay_map.insert(1, "closed".to_string());
    relay_map.insert(2, "pulse".to_string());

    let registers = vec![
        Register::enumeration(
            Arc::clone(&device),
            "Relays",
            "R",
            "Relay",
            relay_map,
            0,
            true,
        ),
        Register::number(
            Arc::clone(&device),
            "Settings",
            "Setpoint",
            "Setpoint",
            Some("W".into()),
            1,
            true,
            NumberMeta::default(),
        ),
        Register::number(
            Arc::clone(&device),
            "Essential",
            "Power",
            "Power",
            Some("W".into()),
            2,
            false,
            NumberMeta::default(),
        ),
    ];

    let storage = ValueStorage::new(false);
    let command_storage = ValueStorage::new(false);
    let context = DeviceContext::new("dev0", DeviceSettings::default());
    let driver = Arc::new(StubDriver {
        context: Arc::clone(&context),
        registers,
    });
    let runner = DeviceRunner::new(
        context,
        driver as Arc<dyn Driver>,
        Arc::clone(&storage),
        Arc::clone(&command_storage),
        CancellationToken::new(),
    );
    let mut devices = DevicePool::new();
    devices.insert(runner);

    let view = ViewSection {
        name: "main".to_string(),
        title: "Main".to_string(),
        devices: vec![ViewDeviceSection {
            name: "dev0".to_string(),
            title: None,
            skip_fields: Vec::new(),
            skip_categories: vec!["Settings".to_string()],
        }],
        autoplay: true,
        allowed_users: Vec::new(),
        hidden: false,
    };

    let state = Arc::new(AppState {
        project_title: "test".to_string(),
        views: vec![view],
        storage: Arc::clone(&storage),
        command_storage: Arc::clone(&command_storage),
        devices: Arc::new(devices),
        auth: None,
        config_expires: std::time::Duration::from_secs(60),
    });
    Fixture {
        state,
        storage,
        command_storage,
    }
}

#[actix_web::test]
async fn patch_rejects_type_mismatches() {
    let fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(Arc::clone(&fixture.state)))
            .configure(configure_api),
    )
    .await;

    // string onto an enum register: 422 naming the register and "float"
    let req = test::TestRequest::patch()
        .uri("/views/main/devices/dev0/values")
        .set_json(json!({"R": "foo"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 422);
    let body: serde_json::Value = test::read_body_json(resp).await;
    let message = body["message"].as_str().unwrap();
    assert!(message.contains('R'), "message: {message}");
    assert!(message.contains("float"), "message: {message}");
    assert!(fixture.command_storage.get("dev0", "R").is_none());

    // unknown register
    let req = test::TestRequest::patch()
        .uri("/views/main/devices/dev0/values")
        .set_json(json!({"Nope": 1}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 422);

    // non-controllable register
    let req = test::TestRequest::patch()
        .uri("/views/main/devices/dev0/values")
        .set_json(json!({"Power": 1.0}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 422);
}

#[actix_web::test]
async fn patch_accepts_enum_indexes_onto_the_command_storage() {
    let fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(Arc::clone(&fixture.state)))
            .configure(configure_api),
    )
    .await;

    let req = test::TestRequest::patch()
        .uri("/views/main/devices/dev0/values")
        .set_json(json!({"R": 2}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let command = fixture.command_storage.get("dev0", "R").unwrap();
    assert_eq!(command.payload(), &ValuePayload::Enum(2));
    // nothing leaks into the state storage
    assert!(fixture.storage.get("dev0", "R").is_none());
}

#[actix_web::test]
async fn get_values_applies_the_view_skip_lists() {
    let fixture = fixture();
    let power = Register::number(
        Arc::from("dev0"),
        "Essential",
        "Power",
        "Power",
        Some("W".into()),
        2,
        false,
        NumberMeta::default(),
    );
    let setpoint = Register::number(
        Arc::from("dev0"),
        "Settings",
        "Setpoint",
        "Setpoint",
        Some("W".into()),
        1,
        true,
        NumberMeta::default(),
    );
    fixture.storage.fill(Value::numeric(power, 42.0));
    fixture.storage.fill(Value::numeric(setpoint, 7.0));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(Arc::clone(&fixture.state)))
            .configure(configure_api),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/views/main/devices/dev0/values")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["Power"], json!(42.0));
    // the Settings category is skipped by the view
    assert!(body.get("Setpoint").is_none());

    // unknown view and device are 404
    let req = test::TestRequest::get()
        .uri("/views/nope/devices/dev0/values")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);
    let req = test::TestRequest::get()
        .uri("/views/main/devices/nope/values")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);
}

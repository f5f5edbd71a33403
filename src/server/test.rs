use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{
    http::StatusCode,
    test::{self, TestRequest},
    web,
    web::Data,
    App,
};
use futures::future::join3;

use super::metrics::Metrics;
use super::ServerState;
use crate::build_app;
use crate::config::ImposterConfig;
use crate::server::build_cors;
use crate::settings::Settings;
use crate::store::{inmemory::InMemoryStoreProvider, StoreFactory};
use crate::template::ServerInfo;

fn test_state(yaml: &str, config_dir: PathBuf) -> Data<ServerState> {
    let config = ImposterConfig::from_yaml(yaml).expect("invalid test config");
    let stores = StoreFactory::new(Arc::new(InMemoryStoreProvider::new(None)));
    stores.preload(&config.stores, &config_dir);
    Data::new(ServerState::new(
        config,
        stores,
        Metrics::noop(),
        config_dir,
        ServerInfo {
            port: 8080,
            url: "http://localhost:8080".to_owned(),
        },
    ))
}

macro_rules! init_app {
    ($state: expr) => {
        test::init_service(build_app!($state, build_cors(&Settings::default()))).await
    };
}

async fn body_string<B>(response: actix_web::dev::ServiceResponse<B>) -> String
where
    B: actix_web::body::MessageBody,
    B::Error: std::fmt::Debug,
{
    let body = test::read_body(response).await;
    String::from_utf8_lossy(&body).into_owned()
}

#[actix_web::test]
async fn rest_exact_match_and_404() {
    let state = test_state(
        r#"
plugin: rest
resources:
  - method: GET
    path: /test
    response:
      content: test response
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response = test::call_service(&app, TestRequest::get().uri("/test").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "test response");

    let response = test::call_service(&app, TestRequest::get().uri("/other").to_request()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn interceptor_short_circuits_before_resources() {
    let state = test_state(
        r#"
interceptors:
  - method: GET
    path: /test
    continue: false
    response:
      content: intercepted
resources:
  - method: GET
    path: /test
    response:
      content: orig
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response = test::call_service(&app, TestRequest::get().uri("/test").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "intercepted");
}

#[actix_web::test]
async fn continuing_interceptor_captures_for_later_resources() {
    let state = test_state(
        r#"
interceptors:
  - path: /greet/{name}
    continue: true
    capture:
      who:
        pathParam: name
resources:
  - method: GET
    path: /greet/{name}
    response:
      template: true
      content: "hi ${stores.request.who}"
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response =
        test::call_service(&app, TestRequest::get().uri("/greet/ada").to_request()).await;
    assert_eq!(body_string(response).await, "hi ada");
}

#[actix_web::test]
async fn capture_feeds_response_templates() {
    let state = test_state(
        r#"
resources:
  - method: GET
    path: /u/{id}
    capture:
      uid:
        pathParam: id
    response:
      template: true
      content: "hello ${stores.request.uid}"
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response = test::call_service(&app, TestRequest::get().uri("/u/42").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "hello 42");
}

#[actix_web::test]
async fn json_path_body_predicate_selects_the_resource() {
    let state = test_state(
        r#"
resources:
  - method: POST
    path: /ok
    requestBody:
      jsonPath: $.name
      value: Grace
    response:
      content: ok
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let hit = TestRequest::post()
        .uri("/ok")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(r#"{"name": "Grace"}"#)
        .to_request();
    let response = test::call_service(&app, hit).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ok");

    let miss = TestRequest::post()
        .uri("/ok")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(r#"{"name": "Jane"}"#)
        .to_request();
    let response = test::call_service(&app, miss).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn concurrency_limit_rejects_the_excess_request() {
    let state = test_state(
        r#"
resources:
  - method: GET
    path: /rl
    concurrency:
      - limit: 2
        response:
          statusCode: 429
          content: too busy
    response:
      delay:
        exact: 200
      content: ok
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let (first, second, third) = join3(
        test::call_service(&app, TestRequest::get().uri("/rl").to_request()),
        test::call_service(&app, TestRequest::get().uri("/rl").to_request()),
        test::call_service(&app, TestRequest::get().uri("/rl").to_request()),
    )
    .await;

    let mut statuses = vec![first.status(), second.status(), third.status()];
    statuses.sort();
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );

    // the decrements ran; a fresh request is admitted again
    let response = test::call_service(&app, TestRequest::get().uri("/rl").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ok");
}

#[actix_web::test]
async fn script_step_can_claim_the_response() {
    let state = test_state(
        r#"
resources:
  - method: GET
    path: /scripted
    steps:
      - type: script
        lang: js
        code: |
          respond()
            .withStatusCode(202)
            .withContent('scripted ' + context.request.queryParams.tag)
            .skipDefaultBehaviour();
    response:
      content: default body
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response =
        test::call_service(&app, TestRequest::get().uri("/scripted?tag=a").to_request()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_string(response).await, "scripted a");
}

#[actix_web::test]
async fn failing_step_yields_a_500() {
    let state = test_state(
        r#"
resources:
  - method: GET
    path: /broken
    steps:
      - type: script
        code: "throw new Error('nope');"
    response:
      content: unreachable
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response = test::call_service(&app, TestRequest::get().uri("/broken").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

const PET_ENVELOPE: &str = r#"<?xml version="1.0"?>
<env:Envelope xmlns:env="http://schemas.xmlsoap.org/soap/envelope/">
  <env:Body>
    <pets:getPetByIdRequest xmlns:pets="urn:com:example:petstore">
      <pets:id>3</pets:id>
    </pets:getPetByIdRequest>
  </env:Body>
</env:Envelope>"#;

fn soap_state() -> Data<ServerState> {
    test_state(
        r#"
plugin: soap
wsdl:
  operations:
    - name: getPetById
      soapAction: getPetById
      binding: PetBinding
      inputElement:
        namespace: urn:com:example:petstore
        local: getPetByIdRequest
      envelopeNamespace: http://schemas.xmlsoap.org/soap/envelope/
resources:
  - path: /pets/
    operation: getPetById
    response:
      content: <pet>Rex</pet>
"#,
        PathBuf::from("."),
    )
}

#[actix_web::test]
async fn soap_operation_resolves_via_soap_action() {
    let app = init_app!(soap_state());

    let request = TestRequest::post()
        .uri("/pets/")
        .insert_header(("Content-Type", "text/xml"))
        .insert_header(("SOAPAction", "\"getPetById\""))
        .set_payload(PET_ENVELOPE)
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "<pet>Rex</pet>");
}

#[actix_web::test]
async fn soap_non_post_is_method_not_allowed() {
    let app = init_app!(soap_state());

    let response = test::call_service(&app, TestRequest::get().uri("/pets/").to_request()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[actix_web::test]
async fn soap_no_match_is_a_fault_with_404() {
    let app = init_app!(soap_state());

    let unknown = PET_ENVELOPE.replace("getPetByIdRequest", "unknownRequest");
    let request = TestRequest::post()
        .uri("/pets/")
        .insert_header(("Content-Type", "text/xml"))
        .set_payload(unknown)
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_string(response).await;
    assert!(body.contains("env:Fault") || body.contains("Fault"));
}

#[actix_web::test]
async fn soap_invalid_envelope_is_a_fault_with_400() {
    let app = init_app!(soap_state());

    let request = TestRequest::post()
        .uri("/pets/")
        .insert_header(("Content-Type", "text/xml"))
        .set_payload("this is not xml")
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("Fault"));
}

#[actix_web::test]
async fn store_preload_data_is_visible_to_templates() {
    let state = test_state(
        r#"
stores:
  pets:
    preloadData:
      favourite: Rex
resources:
  - method: GET
    path: /fav
    response:
      template: true
      content: "fav=${stores.pets.favourite}"
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response = test::call_service(&app, TestRequest::get().uri("/fav").to_request()).await;
    assert_eq!(body_string(response).await, "fav=Rex");
}

#[actix_web::test]
async fn best_match_prefers_the_more_specific_resource() {
    let state = test_state(
        r#"
resources:
  - method: GET
    path: /example/{version}
    response:
      content: pure
  - method: GET
    path: /example/{version}.diff
    response:
      content: mixed
"#,
        PathBuf::from("."),
    );
    let app = init_app!(state);

    let response =
        test::call_service(&app, TestRequest::get().uri("/example/123.diff").to_request()).await;
    assert_eq!(body_string(response).await, "mixed");

    let response =
        test::call_service(&app, TestRequest::get().uri("/example/123").to_request()).await;
    assert_eq!(body_string(response).await, "pure");
}

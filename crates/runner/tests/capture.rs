use creevey_runner::capture::capture;
use creevey_runner::driver::{Connector, WindowSize};
use creevey_runner::testing::{gradient, FakeConnector, FakeElement, FakeState};
use creevey_runner::RunnerError;
use image::RgbaImage;
use serde_json::json;

fn decode(png: &[u8]) -> RgbaImage {
    image::load_from_memory(png).unwrap().to_rgba8()
}

fn page(width: u32, height: u32, viewport: (u32, u32)) -> FakeState {
    FakeState::new(
        gradient(width, height),
        WindowSize {
            width: viewport.0,
            height: viewport.1,
        },
    )
}

/// An element twice as wide as the viewport is captured from exactly two tiles
#[tokio::test]
async fn composite_capture_of_double_width_element() {
    let state = page(300, 200, (100, 50)).with_element(
        "#wide",
        FakeElement {
            left: 0.0,
            top: 0.0,
            width: 200.0,
            height: 50.0,
        },
    );
    let expected = state.element_image("#wide").unwrap();
    let connector = FakeConnector::new(state);
    let driver = connector.connect("fake", &json!({})).await.unwrap();

    let shot = decode(&capture(driver.as_ref(), Some("#wide")).await.unwrap());

    assert_eq!(shot.dimensions(), (200, 50));
    for x in 98..102 {
        assert_eq!(shot.get_pixel(x, 10), expected.get_pixel(x, 10), "column {}", x);
    }
    assert_eq!(shot, expected);

    let state = connector.state();
    let state = state.lock();
    assert_eq!(state.screenshots, 2);
    assert!(!state.scroll_hidden);
    assert_eq!(state.scroll_restores, 1);
}

/// The last row is shifted when the final scroll position is clamped
#[tokio::test]
async fn composite_capture_corrects_last_row() {
    let state = page(100, 200, (100, 50)).with_element(
        "#tall",
        FakeElement {
            left: 0.0,
            top: 30.0,
            width: 100.0,
            height: 120.0,
        },
    );
    let expected = state.element_image("#tall").unwrap();
    let connector = FakeConnector::new(state);
    let driver = connector.connect("fake", &json!({})).await.unwrap();

    let shot = decode(&capture(driver.as_ref(), Some("#tall")).await.unwrap());

    assert_eq!(shot, expected);
    assert_eq!(connector.state().lock().screenshots, 3);
}

#[tokio::test]
async fn element_inside_viewport_uses_element_screenshot() {
    let state = page(200, 200, (100, 100)).with_element(
        "#small",
        FakeElement {
            left: 10.0,
            top: 20.0,
            width: 30.0,
            height: 40.0,
        },
    );
    let expected = state.element_image("#small").unwrap();
    let connector = FakeConnector::new(state);
    let driver = connector.connect("fake", &json!({})).await.unwrap();

    let shot = decode(&capture(driver.as_ref(), Some("#small")).await.unwrap());
    assert_eq!(shot, expected);
    assert_eq!(connector.state().lock().scroll_restores, 1);
}

#[tokio::test]
async fn missing_element_fails_and_restores_scroll() {
    let connector = FakeConnector::new(page(100, 100, (100, 100)));
    let driver = connector.connect("fake", &json!({})).await.unwrap();

    let err = capture(driver.as_ref(), Some("#nope")).await.unwrap_err();
    assert!(matches!(err, RunnerError::Capture(_)));

    let state = connector.state();
    let state = state.lock();
    assert!(!state.scroll_hidden);
    assert_eq!(state.scroll_restores, 1);
}

#[tokio::test]
async fn no_selector_takes_viewport_screenshot() {
    let state = page(300, 300, (120, 80));
    let expected = state.viewport_image();
    let connector = FakeConnector::new(state);
    let driver = connector.connect("fake", &json!({})).await.unwrap();

    let shot = decode(&capture(driver.as_ref(), None).await.unwrap());
    assert_eq!(shot, expected);
    assert_eq!(connector.state().lock().scroll_restores, 0);
}

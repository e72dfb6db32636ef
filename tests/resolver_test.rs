mod common;

use std::collections::HashMap;

use common::{FakeProvider, FakeSurface, SurfaceScript};
use pahe_engine::error::PipelineError;
use pahe_engine::resolver::Resolver;

const ORIGIN: &str = "https://animepahe.ru";

/// A page that walks the whole chain: continue affordance, terminal URL,
/// title, submit form.
fn full_chain_script() -> SurfaceScript {
    SurfaceScript {
        cookies: HashMap::from([("kwik_session".to_string(), "s1".to_string())]),
        current_url: "https://kwik.si/f/abc".to_string(),
        elements: HashMap::from([
            (".redirect".to_string(), vec![1]),
            (".title".to_string(), vec![2]),
            ("button[type='submit']".to_string(), vec![3]),
        ]),
        texts: HashMap::from([(2, "My Show Episode 1".to_string())]),
        form_action: Some("https://files.example.com/d/xyz".to_string()),
        form_data: serde_json::json!({"_token": "t123"}),
        user_agent: Some("TestUA/1.0".to_string()),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn full_chain_produces_descriptor() {
    let surface = FakeSurface::new(full_chain_script());
    let provider = FakeProvider::new(vec![surface.clone()]);
    let resolver = Resolver::new(provider, ORIGIN);

    let descriptor = resolver
        .resolve("https://pahe.example.com/i/hop1")
        .await
        .unwrap();

    assert_eq!(descriptor.url, "https://files.example.com/d/xyz");
    assert_eq!(descriptor.form_data.get("_token").unwrap(), "t123");
    assert_eq!(descriptor.cookies.get("kwik_session").unwrap(), "s1");
    assert_eq!(descriptor.headers.get("User-Agent").unwrap(), "TestUA/1.0");
    assert_eq!(descriptor.headers.get("Referer").unwrap(), "https://kwik.si/f/abc");
    assert_eq!(
        descriptor.headers.get("Content-Type").unwrap(),
        "application/x-www-form-urlencoded"
    );
    assert_eq!(descriptor.filename.as_deref(), Some("My_Show_Episode_1.mp4"));

    assert_eq!(
        surface.navigations.lock().unwrap().as_slice(),
        ["https://pahe.example.com/i/hop1"]
    );
    // Surface torn down exactly once, single-context invariant re-enforced
    // after the steps.
    assert_eq!(surface.quit_count(), 1);
    assert!(surface.close_tab_count() >= 3);
}

#[tokio::test(start_paused = true)]
async fn missing_action_url_is_fatal_but_still_tears_down() {
    // Nothing on the page at all: soft steps fall through, step 5 fails.
    let surface = FakeSurface::new(SurfaceScript::default());
    let provider = FakeProvider::new(vec![surface.clone()]);
    let resolver = Resolver::new(provider, ORIGIN);

    let err = resolver
        .resolve("https://pahe.example.com/i/hop1")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Resolution(_)));
    assert_eq!(surface.quit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn relative_action_url_is_rejected() {
    let mut script = full_chain_script();
    script.form_action = Some("/relative/submit".to_string());
    let surface = FakeSurface::new(script);
    let provider = FakeProvider::new(vec![surface.clone()]);
    let resolver = Resolver::new(provider, ORIGIN);

    let err = resolver
        .resolve("https://pahe.example.com/i/hop1")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Resolution(_)));
    assert_eq!(surface.quit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_title_leaves_filename_absent() {
    let mut script = full_chain_script();
    script.elements.remove(".title");
    let surface = FakeSurface::new(script);
    let provider = FakeProvider::new(vec![surface]);
    let resolver = Resolver::new(provider, ORIGIN);

    let descriptor = resolver
        .resolve("https://pahe.example.com/i/hop1")
        .await
        .unwrap();
    assert!(descriptor.filename.is_none());
}

fn play_page_script() -> SurfaceScript {
    SurfaceScript {
        elements: HashMap::from([
            ("div.click-to-load".to_string(), vec![9]),
            ("#resolutionMenu button.dropdown-item".to_string(), vec![10, 11]),
        ]),
        attributes: HashMap::from([
            (
                10,
                HashMap::from([
                    ("data-src".to_string(), "https://c.example.com/a.m3u8".to_string()),
                    ("data-resolution".to_string(), "720".to_string()),
                    ("data-audio".to_string(), "jpn".to_string()),
                    ("data-fansub".to_string(), "SubsA".to_string()),
                ]),
            ),
            (
                11,
                HashMap::from([
                    ("data-src".to_string(), "https://c.example.com/b.m3u8".to_string()),
                    ("data-resolution".to_string(), "1080".to_string()),
                    ("data-audio".to_string(), "eng".to_string()),
                    ("data-fansub".to_string(), "SubsB".to_string()),
                    ("class".to_string(), "dropdown-item active".to_string()),
                ]),
            ),
        ]),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn stream_link_prefers_exact_match() {
    let surface = FakeSurface::new(play_page_script());
    let provider = FakeProvider::new(vec![surface.clone()]);
    let resolver = Resolver::new(provider, ORIGIN);

    let info = resolver
        .stream_link("anime-sess", "ep-sess", "720", "jpn")
        .await
        .unwrap();

    assert_eq!(info.manifest_url, "https://c.example.com/a.m3u8");
    assert_eq!(info.quality, "720");
    assert_eq!(info.language, "jpn");
    assert_eq!(info.source_label, "SubsA");
    assert_eq!(info.anime_session, "anime-sess");
    assert_eq!(info.episode_session, "ep-sess");

    assert_eq!(
        surface.navigations.lock().unwrap().as_slice(),
        [format!("{ORIGIN}/play/anime-sess/ep-sess")]
    );
    assert_eq!(surface.quit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_link_falls_back_to_active_entry() {
    let surface = FakeSurface::new(play_page_script());
    let provider = FakeProvider::new(vec![surface]);
    let resolver = Resolver::new(provider, ORIGIN);

    let info = resolver
        .stream_link("anime-sess", "ep-sess", "480", "ger")
        .await
        .unwrap();
    assert_eq!(info.manifest_url, "https://c.example.com/b.m3u8");
    assert_eq!(info.quality, "1080");
}

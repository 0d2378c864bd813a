use std::{rc::Rc, time::Duration};

use async_trait::async_trait;
use catalog_sync::{
    query_key, storage::FileStorage, Board, City, ClassOption, Error, QueryKey, QueryOptions,
    ReferenceDataSource, ServicesOptions, SyncServices, ThemeMode,
};

#[derive(Debug, Clone, PartialEq)]
struct Course {
    id: u32,
    title: String,
}

// Stands in for the remote API.
async fn get_courses(key: QueryKey) -> Result<Vec<Course>, Error> {
    log::info!("GET {key}");
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok((1..=3)
        .map(|id| Course {
            id,
            title: format!("Course {id}"),
        })
        .collect())
}

async fn get_teacher(key: QueryKey) -> Result<String, Error> {
    log::info!("GET {key}");
    tokio::time::sleep(Duration::from_millis(150)).await;
    Err(Error::from_status(404, "teacher not found"))
}

struct DemoReferenceData;

#[async_trait(?Send)]
impl ReferenceDataSource for DemoReferenceData {
    async fn fetch_classes(&self) -> Result<Vec<ClassOption>, Error> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok((9..=12)
            .map(|id| ClassOption {
                id,
                name: format!("Class {id}"),
            })
            .collect())
    }

    async fn fetch_boards(&self) -> Result<Vec<Board>, Error> {
        tokio::time::sleep(Duration::from_millis(120)).await;
        Ok(vec![
            Board {
                id: 1,
                name: "CBSE".into(),
            },
            Board {
                id: 2,
                name: "ICSE".into(),
            },
        ])
    }

    async fn fetch_cities(&self, state_id: u32) -> Result<Vec<City>, Error> {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(vec![City {
            id: state_id * 10,
            name: format!("City of state {state_id}"),
        }])
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    _ = simple_logger::init_with_level(log::Level::Debug);

    tokio::task::LocalSet::new().run_until(run()).await
}

async fn run() -> Result<(), Error> {
    let path = std::env::temp_dir().join("catalog-demo").join("storage.json");
    let storage = Rc::new(FileStorage::new(&path));
    log::info!("Storage at {}", path.display());

    let services = SyncServices::init(storage, Rc::new(DemoReferenceData), ServicesOptions::default()).await;

    let mut busy = services.busy().subscribe();
    tokio::task::spawn_local(async move {
        while busy.changed().await.is_ok() {
            let visible = *busy.borrow();
            log::info!("Overlay {}", if visible { "shown" } else { "hidden" });
        }
    });

    if services.session().is_first_visit().await {
        log::info!("Welcome! Showing onboarding");
        services.session().mark_visited().await?;
        services.preferences().set_onboarding_seen(true);
    }

    // Two screens mount the same query in the same tick.
    let options = QueryOptions::default().set_track_busy(true);
    let list = services
        .client()
        .query(query_key!["courses", 5], get_courses, options.clone());
    let header = services.client().query(query_key!["courses", 5], get_courses, options);
    let count = header.select(|courses: &Vec<Course>| courses.len());

    list.settled().await;
    for course in list.data().unwrap_or_default() {
        log::info!("List shows #{} {}", course.id, course.title);
    }
    log::info!("Header shows {} courses", count.get().unwrap_or_default());

    let teacher = services
        .client()
        .fetch_query(query_key!["teacher", 9], get_teacher, QueryOptions::default())
        .await;
    log::info!("Teacher lookup: {teacher:?}");

    let renamed = services
        .client()
        .mutate(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, Error>("Course 1 (updated)".to_string())
            },
            &[query_key!["courses"]],
        )
        .await?;
    log::info!("Mutation returned {renamed}");
    list.settled().await;

    services.registration().load_all_data().await?;
    let draft = services.registration().draft();
    log::info!(
        "Signup offers {} classes and {} boards",
        draft.classes.len(),
        draft.state_boards.len()
    );
    let cities = services.registration().load_cities_for_state(27).await?;
    log::info!("Cities: {cities:?}");

    let next_theme = match services.preferences().ui().theme_mode {
        ThemeMode::Dark => ThemeMode::Light,
        _ => ThemeMode::Dark,
    };
    services.preferences().set_theme_mode(next_theme);
    services.preferences().set_search_draft("physics");
    log::info!("Preferences: {:?}", services.preferences());

    services
        .session()
        .save_credentials("demo-token", "{\"name\":\"Demo\"}", "1")
        .await?;
    services.session().login();
    log::info!("Logged in: {}", services.session().is_logged_in());
    log::info!("After logout: {:?}", services.logout().await);

    services.teardown().await;
    Ok(())
}

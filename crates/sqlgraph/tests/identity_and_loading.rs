//! Identity map, batched loading and finds.

mod support;

use sqlgraph::{
    Cx, EntityManagerConfig, EntityRef, Error, Filter, FlushOptions, IdValue, Page, Row, Value,
};
use support::*;

#[test]
fn loads_return_one_instance_per_id() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let tagged = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        let untagged = unwrap_outcome(em.load(&cx, "Author", "1").await);
        assert_eq!(tagged, untagged);
        assert_eq!(tagged.tagged_id().as_deref(), Some("a:1"));

        // The second load was answered by the identity map.
        assert_eq!(driver.count("SELECT authors"), 1);

        let found = unwrap_outcome(em.find(&cx, "Author", Filter::new().eq("first_name", "a1")).await);
        assert_eq!(found, vec![tagged.clone()]);
        assert_eq!(em.find_existing("a:1"), Some(tagged));
    });
}

#[test]
fn concurrent_loads_coalesce_into_one_query() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let (a1, a2, b1) = futures::join!(
            em.load(&cx, "Author", "a:1"),
            em.load(&cx, "Author", "a:2"),
            em.load(&cx, "Book", "b:1"),
        );
        let (a1, a2, b1) = (unwrap_outcome(a1), unwrap_outcome(a2), unwrap_outcome(b1));
        assert_eq!(a1.get_by_name("first_name").unwrap(), Value::from("a1"));
        assert_eq!(a2.get_by_name("first_name").unwrap(), Value::from("a2"));
        assert_eq!(b1.get_by_name("title").unwrap(), Value::from("b1"));
    });

    assert_eq!(driver.count("SELECT authors"), 1);
    assert_eq!(driver.count("SELECT books"), 1);
}

#[test]
fn missing_ids_are_reported_together() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        match expect_err(em.load(&cx, "Author", "a:9").await) {
            Error::NotFound(e) => assert_eq!(e.ids, vec!["a:9"]),
            other => panic!("unexpected error: {other}"),
        }

        match expect_err(em.load_all(&cx, "Author", &["a:1", "a:8", "7"]).await) {
            Error::NotFound(e) => {
                assert_eq!(e.entity, "Author");
                assert_eq!(e.ids, vec!["a:8", "a:7"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let found = unwrap_outcome(em.load_all_if_exists(&cx, "Author", &["a:1", "a:8", "a:2"]).await);
        let ids: Vec<_> = found.iter().filter_map(|a| a.tagged_id()).collect();
        assert_eq!(ids, vec!["a:1", "a:2"]);
    });
}

#[test]
fn register_rejects_a_second_instance() {
    let driver = MemoryDriver::new();
    let em = manager(&driver);
    let row = Row::from_pairs([("id", Value::BigInt(5)), ("first_name", Value::from("a5"))]);

    let author = em.register("Author", &row).unwrap();
    assert!(!author.is_new());
    assert_eq!(author.id(), Some(IdValue::Int(5)));

    let err = em.register("Author", &row).unwrap_err();
    assert!(matches!(err, Error::DuplicateEntity { ref tagged_id } if tagged_id == "a:5"));
}

#[test]
fn entity_limit_caps_the_unit_of_work() {
    let driver = MemoryDriver::new();
    let em = manager_with(&driver, EntityManagerConfig::new().entity_limit(2));
    em.create("Tag").unwrap();
    em.create("Tag").unwrap();
    let err = em.create("Tag").unwrap_err();
    assert!(matches!(err, Error::TooManyEntities { limit: 2 }));
}

#[test]
fn identical_finds_share_a_query() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        driver.clear_log();
        let by_author = || Filter::new().entity("author", &a1).order_by("title", true);
        let (first, second) = futures::join!(
            em.find(&cx, "Book", by_author()),
            em.find(&cx, "Book", by_author()),
        );
        let (first, second) = (unwrap_outcome(first), unwrap_outcome(second));
        assert_eq!(first, second);
        let titles: Vec<_> = first
            .iter()
            .map(|b| b.get_by_name("title").unwrap())
            .collect();
        assert_eq!(titles, vec![Value::from("b1"), Value::from("b2")]);
    });

    assert_eq!(driver.log(), vec!["SELECT books"]);
}

#[test]
fn find_one_enforces_cardinality() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let one = unwrap_outcome(em.find_one(&cx, "Book", Filter::new().eq("title", "b3")).await);
        assert_eq!(one.and_then(|b| b.tagged_id()).as_deref(), Some("b:3"));

        let none = unwrap_outcome(em.find_one(&cx, "Book", Filter::new().eq("title", "zz")).await);
        assert!(none.is_none());

        let many = expect_err(em.find_one(&cx, "Book", Filter::new().eq("author", 1_i64)).await);
        assert!(matches!(many, Error::TooMany { entity: "Book", count: 2 }));

        let missing =
            expect_err(em.find_one_or_fail(&cx, "Book", Filter::new().eq("title", "zz")).await);
        assert!(matches!(missing, Error::NotFound(ref e) if e.entity == "Book"));
    });
}

#[test]
fn paginated_finds_are_not_batched() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let ordered = || Filter::new().order_by("title", true);
        let (first, second) = futures::join!(
            em.find_paginated(&cx, "Book", ordered(), Page::new(2, 0)),
            em.find_paginated(&cx, "Book", ordered(), Page::new(2, 2)),
        );
        let ids = |books: Vec<sqlgraph::EntityRef>| -> Vec<String> {
            books.iter().filter_map(|b| b.tagged_id()).collect()
        };
        assert_eq!(ids(unwrap_outcome(first)), vec!["b:1", "b:2"]);
        assert_eq!(ids(unwrap_outcome(second)), vec!["b:3"]);
    });

    assert_eq!(driver.count("SELECT books"), 2);
}

#[test]
fn find_with_new_or_changed_sees_unflushed_state() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let b2 = unwrap_outcome(em.load(&cx, "Book", "b:2").await);
        b2.set_by_name("title", "renamed").unwrap();
        let fresh = em.create_with("Book", [("title", Value::from("b2"))]).unwrap();

        let stored = unwrap_outcome(em.find(&cx, "Book", Filter::new().eq("title", "b2")).await);
        assert_eq!(stored, vec![b2.clone()]);

        let current = unwrap_outcome(
            em.find_with_new_or_changed(&cx, "Book", Filter::new().eq("title", "b2"))
                .await,
        );
        assert_eq!(current, vec![fresh]);
    });
}

/// Sorted tagged ids; unsaved entities show as "new".
fn labels(entities: Vec<EntityRef>) -> Vec<String> {
    let mut labels: Vec<String> = entities
        .iter()
        .map(|e| e.tagged_id().unwrap_or_else(|| "new".to_string()))
        .collect();
    labels.sort();
    labels
}

/// In-memory matching results for one edit session under `threshold`.
fn in_memory_matches(threshold: usize) -> Vec<Vec<String>> {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager_with(&driver, EntityManagerConfig::new().index_threshold(threshold));
    let cx = Cx::for_testing();
    let mut results = Vec::new();

    run(async {
        let books = unwrap_outcome(
            em.find(&cx, "Book", Filter::new().order_by("title", true)).await,
        );
        assert_eq!(labels(books.clone()), vec!["b:1", "b:2", "b:3"]);
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        let author = books[0].field_id("author").unwrap();

        let a3 = em.create_with("Author", [("first_name", Value::from("a3"))]).unwrap();
        let b4 = em.create_with("Book", [("title", Value::from("b4"))]).unwrap();
        b4.many_to_one(author).set(Some(&a3)).unwrap();
        books[2].many_to_one(author).set(Some(&a3)).unwrap();
        books[1].set_by_name("title", "b4").unwrap();

        let by_author = |target: &EntityRef| Filter::new().eq("author", target);
        results.push(labels(unwrap_outcome(
            em.find_with_new_or_changed(&cx, "Book", by_author(&a3)).await,
        )));
        results.push(labels(unwrap_outcome(
            em.find_with_new_or_changed(&cx, "Book", Filter::new().eq("title", "b4"))
                .await,
        )));
        results.push(labels(unwrap_outcome(
            em.find_with_new_or_changed(&cx, "Book", by_author(&a1)).await,
        )));
        let a3_books = a3.one_to_many(a3.field_id("books").unwrap());
        results.push(labels(unwrap_outcome(a3_books.load(&cx).await)));

        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        assert_eq!(a3.tagged_id().as_deref(), Some("a:3"));

        // Children keyed under the unsaved author are still found by its id.
        let b5 = em.create_with("Book", [("title", Value::from("b5"))]).unwrap();
        b5.many_to_one(author).set(Some(&a3)).unwrap();
        results.push(labels(unwrap_outcome(
            em.find_with_new_or_changed(&cx, "Book", by_author(&a3)).await,
        )));
        results.push(labels(a3_books.get().unwrap()));
        let a1_books = a1.one_to_many(a1.field_id("books").unwrap());
        results.push(labels(unwrap_outcome(a1_books.load(&cx).await)));
    });
    results
}

#[test]
fn indexed_matching_agrees_with_a_scan() {
    let indexed = in_memory_matches(2);
    let scanned = in_memory_matches(1_000);
    assert_eq!(indexed, scanned);
    assert_eq!(
        indexed,
        vec![
            vec!["b:3", "new"],
            vec!["b:2", "new"],
            vec!["b:1", "b:2"],
            vec!["b:3", "new"],
            vec!["b:3", "b:4", "new"],
            vec!["b:3", "b:4", "new"],
            vec!["b:1", "b:2"],
        ]
    );
}

#[test]
fn find_by_sql_hydrates_managed_instances() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let tag = unwrap_outcome(em.load(&cx, "Tag", "t:1").await);
        let tags = unwrap_outcome(em.find_by_sql(&cx, "Tag", "SELECT * FROM tags", &[]).await);
        assert_eq!(tags, vec![tag]);
    });

    assert_eq!(driver.count("QUERY SELECT * FROM tags"), 1);
}

#[test]
fn populate_batches_each_level() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let authors = unwrap_outcome(em.load_all(&cx, "Author", &["a:1", "a:2"]).await);
        driver.clear_log();
        unwrap_outcome(em.populate(&cx, &authors, ["books.reviews", "publisher"]).await);

        let books_field = authors[0].field_id("books").unwrap();
        let books = authors[0].one_to_many(books_field).get().unwrap();
        assert_eq!(books.len(), 2);
        let reviews = books[0]
            .one_to_many(books[0].field_id("reviews").unwrap())
            .get()
            .unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(authors[1].one_to_many(books_field).get().unwrap().len(), 1);

        let publisher = authors[0]
            .many_to_one(authors[0].field_id("publisher").unwrap())
            .get()
            .unwrap();
        assert_eq!(publisher.and_then(|p| p.tagged_id()).as_deref(), Some("p:1"));
    });

    assert_eq!(driver.count("SELECT books"), 1);
    assert_eq!(driver.count("SELECT book_reviews"), 1);
    assert_eq!(driver.count("SELECT publishers"), 1);
}

#[test]
fn dropping_the_manager_frees_linked_entities() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let registry = registry();
    let author_meta = std::sync::Arc::clone(registry.get("Author").unwrap());
    let baseline = std::sync::Arc::strong_count(&author_meta);
    let em = sqlgraph::EntityManager::new(std::sync::Arc::clone(&registry), driver.clone());
    let cx = Cx::for_testing();

    let kept = run(async {
        let authors = unwrap_outcome(em.load_all(&cx, "Author", &["a:1", "a:2"]).await);
        unwrap_outcome(em.populate(&cx, &authors, ["books.reviews", "publisher", "image"]).await);
        let books = authors[0]
            .one_to_many(authors[0].field_id("books").unwrap())
            .get()
            .unwrap();
        // Deleted and evicted, but still linked to its author and reviews.
        em.delete(&books[1]).unwrap();
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        books[0].clone()
    });
    assert!(std::sync::Arc::strong_count(&author_meta) > baseline);

    drop(em);
    assert_eq!(std::sync::Arc::strong_count(&author_meta), baseline);
    // A handle kept past the unit of work still knows its reference ids.
    let author = kept.many_to_one(kept.field_id("author").unwrap());
    assert_eq!(author.id(), Some(IdValue::Int(1)));
}

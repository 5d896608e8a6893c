mod proptest_dispatch;

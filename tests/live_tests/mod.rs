mod transport_live_test;
